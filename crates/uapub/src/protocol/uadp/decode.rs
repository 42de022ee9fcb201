// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UADP NetworkMessage decoder.
//!
//! Decoding is split in two: [`decode_headers`] parses everything up to and
//! including the security header without touching the payload, so the
//! receive path can match readers and verify/decrypt first. After the
//! security pass adjusted the cursor, [`decode_payload`] parses the
//! DataSetMessages against the readers' field metadata.

use super::*;
use crate::protocol::{find_meta, EncodingMetaData, FieldMetaData};
use crate::types::encoding::{self, DecodeCtx};
use crate::types::{DataValue, StatusCode, Variant};

/// Parse the NetworkMessage headers. On return the cursor sits on the first
/// payload byte (the Sizes array or the first DataSetMessage).
pub fn decode_headers(ctx: &mut DecodeCtx, nm: &mut NetworkMessage) -> crate::Result<()> {
    let flags = ctx.read_u8()?;
    nm.version = flags & 0x0F;
    if nm.version != NetworkMessage::UADP_VERSION {
        return Err(StatusCode::BAD_DECODING_ERROR);
    }
    nm.publisher_id_enabled = flags & NM_FLAG_PUBLISHER_ID != 0;
    nm.group_header_enabled = flags & NM_FLAG_GROUP_HEADER != 0;
    nm.payload_header_enabled = flags & NM_FLAG_PAYLOAD_HEADER != 0;

    let mut pid_type = 0u8;
    if flags & NM_FLAG_EXTENDED1 != 0 {
        let e1 = ctx.read_u8()?;
        pid_type = e1 & 0x07;
        nm.dataset_class_id_enabled = e1 & EXT1_DATASET_CLASS_ID != 0;
        nm.security_enabled = e1 & EXT1_SECURITY != 0;
        nm.timestamp_enabled = e1 & EXT1_TIMESTAMP != 0;
        nm.picoseconds_enabled = e1 & EXT1_PICOSECONDS != 0;
        if e1 & EXT1_EXTENDED2 != 0 {
            let e2 = ctx.read_u8()?;
            nm.chunk_message = e2 & EXT2_CHUNK != 0;
            nm.promoted_fields_enabled = e2 & EXT2_PROMOTED_FIELDS != 0;
        }
    }

    if nm.chunk_message {
        // Chunked NetworkMessages are not supported.
        return Err(StatusCode::BAD_NOT_SUPPORTED);
    }

    if nm.publisher_id_enabled {
        nm.publisher_id = Some(match pid_type {
            0 => PublisherId::Byte(ctx.read_u8()?),
            1 => PublisherId::UInt16(ctx.read_u16()?),
            2 => PublisherId::UInt32(ctx.read_u32()?),
            3 => PublisherId::UInt64(ctx.read_u64()?),
            4 => PublisherId::String(encoding::read_string(ctx)?),
            _ => return Err(StatusCode::BAD_DECODING_ERROR),
        });
    }

    if nm.dataset_class_id_enabled {
        nm.dataset_class_id = encoding::read_guid(ctx)?;
    }

    if nm.group_header_enabled {
        let gf = ctx.read_u8()?;
        let gh = &mut nm.group_header;
        gh.writer_group_id_enabled = gf & GROUP_FLAG_WRITER_GROUP_ID != 0;
        gh.group_version_enabled = gf & GROUP_FLAG_GROUP_VERSION != 0;
        gh.network_message_number_enabled = gf & GROUP_FLAG_NM_NUMBER != 0;
        gh.sequence_number_enabled = gf & GROUP_FLAG_SEQUENCE_NUMBER != 0;
        if gh.writer_group_id_enabled {
            gh.writer_group_id = ctx.read_u16()?;
        }
        if gh.group_version_enabled {
            gh.group_version = ctx.read_u32()?;
        }
        if gh.network_message_number_enabled {
            gh.network_message_number = ctx.read_u16()?;
        }
        if gh.sequence_number_enabled {
            gh.sequence_number = ctx.read_u16()?;
        }
    }

    if nm.payload_header_enabled {
        let count = ctx.read_u8()? as usize;
        if count == 0 {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
        nm.dataset_writer_ids = Vec::with_capacity(count);
        for _ in 0..count {
            nm.dataset_writer_ids.push(ctx.read_u16()?);
        }
    }

    if nm.timestamp_enabled {
        nm.timestamp = crate::types::DateTime(ctx.read_i64()?);
    }
    if nm.picoseconds_enabled {
        nm.picoseconds = ctx.read_u16()?;
    }

    if nm.promoted_fields_enabled {
        let pf_size = ctx.read_u16()? as usize;
        let end = ctx.pos() + pf_size;
        if end > ctx.end() {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
        while ctx.pos() < end {
            nm.promoted_fields.push(encoding::read_variant(ctx)?);
        }
        if ctx.pos() != end {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
    }

    if nm.security_enabled {
        let sf = ctx.read_u8()?;
        let sh = &mut nm.security_header;
        sh.message_signed = sf & SEC_FLAG_SIGNED != 0;
        sh.message_encrypted = sf & SEC_FLAG_ENCRYPTED != 0;
        sh.footer_enabled = sf & SEC_FLAG_FOOTER != 0;
        sh.force_key_reset = sf & SEC_FLAG_KEY_RESET != 0;
        sh.token_id = ctx.read_u32()?;
        let nonce_len = ctx.read_u8()? as usize;
        if nonce_len > crate::protocol::MAX_NONCE_LENGTH {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
        sh.nonce = ctx.read_bytes(nonce_len)?.to_vec();
        if sh.footer_enabled {
            let _footer_size = ctx.read_u16()?;
        }
    }

    Ok(())
}

fn decode_dsm_header(ctx: &mut DecodeCtx) -> crate::Result<DataSetMessageHeader> {
    let flags1 = ctx.read_u8()?;
    let mut h = DataSetMessageHeader {
        valid: flags1 & DSM_FLAG_VALID != 0,
        field_encoding: FieldEncoding::from_bits((flags1 >> 1) & 0x03)
            .ok_or(StatusCode::BAD_DECODING_ERROR)?,
        sequence_number_enabled: flags1 & DSM_FLAG_SEQUENCE_NUMBER != 0,
        status_enabled: flags1 & DSM_FLAG_STATUS != 0,
        config_version_major_enabled: flags1 & DSM_FLAG_CFG_MAJOR != 0,
        config_version_minor_enabled: flags1 & DSM_FLAG_CFG_MINOR != 0,
        ..Default::default()
    };
    if flags1 & DSM_FLAG_FLAGS2 != 0 {
        let flags2 = ctx.read_u8()?;
        h.message_type = DataSetMessageType::from_bits(flags2 & 0x0F)
            .ok_or(StatusCode::BAD_DECODING_ERROR)?;
        h.timestamp_enabled = flags2 & DSM2_TIMESTAMP != 0;
        h.picoseconds_enabled = flags2 & DSM2_PICOSECONDS != 0;
    }
    if h.sequence_number_enabled {
        h.sequence_number = ctx.read_u16()?;
    }
    if h.timestamp_enabled {
        h.timestamp = crate::types::DateTime(ctx.read_i64()?);
    }
    if h.picoseconds_enabled {
        h.picoseconds = ctx.read_u16()?;
    }
    if h.status_enabled {
        h.status = ctx.read_u16()?;
    }
    if h.config_version_major_enabled {
        h.config_version_major = ctx.read_u32()?;
    }
    if h.config_version_minor_enabled {
        h.config_version_minor = ctx.read_u32()?;
    }
    Ok(h)
}

fn decode_dsm(region: &[u8]) -> crate::Result<DataSetMessage> {
    let mut ctx = DecodeCtx::new(region);
    let header = decode_dsm_header(&mut ctx)?;

    let payload = match header.message_type {
        DataSetMessageType::KeepAlive => DataSetPayload::KeepAlive,
        DataSetMessageType::KeyFrame | DataSetMessageType::Event => {
            match header.field_encoding {
                FieldEncoding::RawData => {
                    DataSetPayload::RawKeyFrame(ctx.read_bytes(ctx.remaining())?.to_vec())
                }
                FieldEncoding::Variant => {
                    let count = ctx.read_u16()? as usize;
                    let mut fields = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        fields.push(DataValue::from_variant(encoding::read_variant(&mut ctx)?));
                    }
                    DataSetPayload::KeyFrame(fields)
                }
                FieldEncoding::DataValue => {
                    let count = ctx.read_u16()? as usize;
                    let mut fields = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        fields.push(encoding::read_data_value(&mut ctx)?);
                    }
                    DataSetPayload::KeyFrame(fields)
                }
            }
        }
        DataSetMessageType::DeltaFrame => {
            if header.field_encoding == FieldEncoding::RawData {
                return Err(StatusCode::BAD_NOT_SUPPORTED);
            }
            let count = ctx.read_u16()? as usize;
            let mut fields = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let index = ctx.read_u16()?;
                let dv = match header.field_encoding {
                    FieldEncoding::Variant => {
                        DataValue::from_variant(encoding::read_variant(&mut ctx)?)
                    }
                    FieldEncoding::DataValue => encoding::read_data_value(&mut ctx)?,
                    FieldEncoding::RawData => unreachable!(),
                };
                fields.push((index, dv));
            }
            DataSetPayload::DeltaFrame(fields)
        }
    };

    Ok(DataSetMessage { header, payload })
}

/// Decode the payload DataSetMessages. The cursor must sit where
/// [`decode_headers`] left it; the logical end must already exclude any
/// signature tail. `meta` supplies the field layouts of the interested
/// readers (unused for self-describing encodings, required to later split
/// raw frames).
pub fn decode_payload(
    ctx: &mut DecodeCtx,
    nm: &mut NetworkMessage,
    _meta: &[EncodingMetaData],
) -> crate::Result<()> {
    let count = if nm.payload_header_enabled { nm.dataset_writer_ids.len() } else { 1 };

    if nm.payload_header_enabled && count > 1 {
        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            sizes.push(ctx.read_u16()? as usize);
        }
        for size in sizes {
            let region = ctx.read_bytes(size)?;
            nm.messages.push(decode_dsm(region)?);
        }
    } else {
        let region = ctx.read_bytes(ctx.remaining())?;
        nm.messages.push(decode_dsm(region)?);
    }
    Ok(())
}

/// Decode trailing footers. No footer content is defined for the supported
/// profiles; the cursor must be fully consumed.
pub fn decode_footers(ctx: &mut DecodeCtx, _nm: &NetworkMessage) -> crate::Result<()> {
    if !ctx.is_at_end() {
        return Err(StatusCode::BAD_DECODING_ERROR);
    }
    Ok(())
}

/// Convenience wrapper: full decode of an unsecured message.
pub fn decode(buffer: &[u8], meta: &[EncodingMetaData]) -> crate::Result<NetworkMessage> {
    let mut ctx = DecodeCtx::new(buffer);
    let mut nm = NetworkMessage::default();
    decode_headers(&mut ctx, &mut nm)?;
    decode_payload(&mut ctx, &mut nm, meta)?;
    decode_footers(&mut ctx, &nm)?;
    Ok(nm)
}

/// Split a raw key frame blob into field values using the reader's metadata.
///
/// Array fields carry one 4-byte length per configured dimension; the
/// dimensions must match the metadata. String/ByteString fields with a
/// `max_string_length` budget are followed by padding up to the budget.
pub fn decode_raw_fields(blob: &[u8], fields: &[FieldMetaData]) -> crate::Result<Vec<DataValue>> {
    let mut ctx = DecodeCtx::new(blob);
    let mut out = Vec::with_capacity(fields.len());
    for fm in fields {
        let ty = fm.built_in().ok_or(StatusCode::BAD_NOT_SUPPORTED)?;

        let mut element_count = 1usize;
        let mut dims = Vec::new();
        for rank in 0..fm.value_rank.max(0) as usize {
            let dim = ctx.read_u32()?;
            if let Some(expected) = fm.array_dimensions.get(rank) {
                if *expected != 0 && *expected != dim {
                    return Err(StatusCode::BAD_DECODING_ERROR);
                }
            }
            dims.push(dim);
            element_count = element_count
                .checked_mul(dim as usize)
                .ok_or(StatusCode::BAD_DECODING_ERROR)?;
        }
        if element_count > blob.len() + 1 {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }

        let mut read_one = |ctx: &mut DecodeCtx| -> crate::Result<Variant> {
            let v = encoding::read_scalar(ctx, ty)?;
            if fm.max_string_length > 0 {
                let actual = match &v {
                    Variant::String(s) => Some(s.len()),
                    Variant::ByteString(b) => Some(b.len()),
                    _ => None,
                };
                if let Some(len) = actual {
                    let budget = fm.max_string_length as usize;
                    if len > budget {
                        return Err(StatusCode::BAD_DECODING_ERROR);
                    }
                    ctx.skip(budget - len)?;
                }
            }
            Ok(v)
        };

        let value = if fm.value_rank > 0 {
            let mut values = Vec::with_capacity(element_count);
            for _ in 0..element_count {
                values.push(read_one(&mut ctx)?);
            }
            Variant::Array {
                elem: ty,
                values,
                dimensions: if dims.len() > 1 { Some(dims) } else { None },
            }
        } else {
            read_one(&mut ctx)?
        };
        out.push(DataValue::from_variant(value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::uadp::encode::{calc_size, encode};
    use crate::types::{DataValue, DateTime};

    fn roundtrip(nm: &NetworkMessage, meta: &[EncodingMetaData]) -> NetworkMessage {
        let size = calc_size(nm, meta).expect("size");
        let mut buf = vec![0u8; size];
        encode(nm, meta, &mut buf, None).expect("encode");
        decode(&buf, meta).expect("decode")
    }

    #[test]
    fn test_roundtrip_single_keyframe() {
        let mut nm = NetworkMessage::new();
        nm.publisher_id_enabled = true;
        nm.publisher_id = Some(PublisherId::UInt32(10));
        nm.group_header_enabled = true;
        nm.group_header.writer_group_id_enabled = true;
        nm.group_header.writer_group_id = 1;
        nm.group_header.sequence_number_enabled = true;
        nm.group_header.sequence_number = 99;
        nm.payload_header_enabled = true;
        nm.dataset_writer_ids = vec![5];
        nm.timestamp_enabled = true;
        nm.timestamp = DateTime(1_000_000);
        nm.messages = vec![DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                field_encoding: FieldEncoding::Variant,
                sequence_number_enabled: true,
                sequence_number: 17,
                ..Default::default()
            },
            payload: DataSetPayload::KeyFrame(vec![
                DataValue::from_variant(Variant::Double(2.5)),
                DataValue::from_variant(Variant::String("pump-1".into())),
            ]),
        }];

        let decoded = roundtrip(&nm, &[]);
        assert_eq!(decoded.publisher_id, Some(PublisherId::UInt32(10)));
        assert_eq!(decoded.group_header.sequence_number, 99);
        assert_eq!(decoded.dataset_writer_ids, vec![5]);
        assert_eq!(decoded.timestamp, DateTime(1_000_000));
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.messages[0].header.sequence_number, 17);
        match &decoded.messages[0].payload {
            DataSetPayload::KeyFrame(fields) => {
                assert_eq!(fields[0].value, Some(Variant::Double(2.5)));
                assert_eq!(fields[1].value, Some(Variant::String("pump-1".into())));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_batched_with_sizes() {
        let mut nm = NetworkMessage::new();
        nm.payload_header_enabled = true;
        nm.dataset_writer_ids = vec![1, 2, 3];
        nm.messages = (0..3)
            .map(|i| DataSetMessage {
                header: DataSetMessageHeader {
                    valid: true,
                    field_encoding: FieldEncoding::Variant,
                    ..Default::default()
                },
                payload: DataSetPayload::KeyFrame(vec![DataValue::from_variant(
                    Variant::UInt32(i),
                )]),
            })
            .collect();

        let decoded = roundtrip(&nm, &[]);
        assert_eq!(decoded.messages.len(), 3);
        for (i, dsm) in decoded.messages.iter().enumerate() {
            match &dsm.payload {
                DataSetPayload::KeyFrame(fields) => {
                    assert_eq!(fields[0].value, Some(Variant::UInt32(i as u32)));
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
    }

    #[test]
    fn test_roundtrip_delta_frame() {
        let mut nm = NetworkMessage::new();
        nm.payload_header_enabled = true;
        nm.dataset_writer_ids = vec![7];
        nm.messages = vec![DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                field_encoding: FieldEncoding::Variant,
                message_type: DataSetMessageType::DeltaFrame,
                ..Default::default()
            },
            payload: DataSetPayload::DeltaFrame(vec![(
                1,
                DataValue::from_variant(Variant::Int64(-5)),
            )]),
        }];

        let decoded = roundtrip(&nm, &[]);
        match &decoded.messages[0].payload {
            DataSetPayload::DeltaFrame(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].0, 1);
                assert_eq!(fields[0].1.value, Some(Variant::Int64(-5)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_keepalive() {
        let mut nm = NetworkMessage::new();
        nm.payload_header_enabled = true;
        nm.dataset_writer_ids = vec![9];
        nm.messages = vec![DataSetMessage::keep_alive(4)];
        let decoded = roundtrip(&nm, &[]);
        assert_eq!(decoded.messages[0].header.message_type, DataSetMessageType::KeepAlive);
        assert_eq!(decoded.messages[0].payload, DataSetPayload::KeepAlive);
    }

    #[test]
    fn test_raw_roundtrip_with_padding() {
        let meta = vec![EncodingMetaData {
            dataset_writer_id: 4,
            fields: vec![
                FieldMetaData {
                    name: "count".into(),
                    built_in_type: crate::types::BuiltInType::UInt16 as u8,
                    value_rank: -1,
                    ..Default::default()
                },
                FieldMetaData {
                    name: "label".into(),
                    built_in_type: crate::types::BuiltInType::String as u8,
                    value_rank: -1,
                    max_string_length: 16,
                    ..Default::default()
                },
            ],
        }];

        let mut nm = NetworkMessage::new();
        nm.payload_header_enabled = true;
        nm.dataset_writer_ids = vec![4];
        nm.messages = vec![DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                field_encoding: FieldEncoding::RawData,
                ..Default::default()
            },
            payload: DataSetPayload::KeyFrame(vec![
                DataValue::from_variant(Variant::UInt16(77)),
                DataValue::from_variant(Variant::String("ok".into())),
            ]),
        }];

        let size = calc_size(&nm, &meta).expect("size");
        let mut buf = vec![0u8; size];
        encode(&nm, &meta, &mut buf, None).expect("encode");
        let decoded = decode(&buf, &meta).expect("decode");

        let blob = match &decoded.messages[0].payload {
            DataSetPayload::RawKeyFrame(blob) => blob.clone(),
            other => panic!("unexpected payload {:?}", other),
        };
        // 2 (u16) + 4 + 2 ("ok") + 14 padding
        assert_eq!(blob.len(), 2 + 4 + 2 + 14);

        let fields = decode_raw_fields(&blob, &meta[0].fields).expect("raw split");
        assert_eq!(fields[0].value, Some(Variant::UInt16(77)));
        assert_eq!(fields[1].value, Some(Variant::String("ok".into())));
    }

    #[test]
    fn test_raw_array_dimension_check() {
        let fm = FieldMetaData {
            name: "vec".into(),
            built_in_type: crate::types::BuiltInType::UInt32 as u8,
            value_rank: 1,
            array_dimensions: vec![3],
            ..Default::default()
        };
        // 3 elements, matching dims
        let mut blob = Vec::new();
        blob.extend_from_slice(&3u32.to_le_bytes());
        for v in [1u32, 2, 3] {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        let fields = decode_raw_fields(&blob, std::slice::from_ref(&fm)).expect("decode");
        assert_eq!(
            fields[0].value,
            Some(Variant::Array {
                elem: crate::types::BuiltInType::UInt32,
                values: vec![Variant::UInt32(1), Variant::UInt32(2), Variant::UInt32(3)],
                dimensions: None,
            })
        );

        // mismatching dimension is rejected
        let mut bad = Vec::new();
        bad.extend_from_slice(&2u32.to_le_bytes());
        bad.extend_from_slice(&1u32.to_le_bytes());
        bad.extend_from_slice(&2u32.to_le_bytes());
        assert!(decode_raw_fields(&bad, std::slice::from_ref(&fm)).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode(&[], &[]).is_err());
        // bad version nibble
        assert!(decode(&[0x0F, 0x00], &[]).is_err());
        // truncated publisher id
        assert!(decode(&[0x11], &[]).is_err());
    }
}
