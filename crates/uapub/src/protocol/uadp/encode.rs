// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UADP NetworkMessage encoder.
//!
//! Two-pass design: [`calc_size`] computes the exact wire length (excluding
//! the signature tail, which the security policy appends), the transport
//! allocates the buffer, [`encode`] writes in place. During the write pass an
//! optional offset table records the byte positions of values that change
//! frame-to-frame so external agents can patch buffers without re-encoding.

use super::*;
use crate::protocol::{find_meta, EncodingMetaData, FieldMetaData};
use crate::types::encoding::{self, EncodeCtx};
use crate::types::{StatusCode, Variant};

/// What a recorded offset points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    NetworkMessageSequenceNumber,
    NetworkMessageTimestamp,
    NetworkMessagePicoseconds,
    DataSetMessageSequenceNumber,
    DataSetMessageTimestamp,
    DataSetMessageStatus,
    DataSetFieldVariant,
    DataSetFieldDataValue,
    DataSetFieldRaw,
}

/// One row of the offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetEntry {
    pub kind: OffsetKind,
    /// Byte offset from the start of the NetworkMessage buffer.
    pub offset: usize,
    /// Index of the DataSetMessage within the NetworkMessage.
    pub dsm: usize,
    /// Field index within the DataSetMessage (0 for message-level entries).
    pub field: usize,
}

/// Regions of an encoded NetworkMessage needed by the security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedLayout {
    /// First byte of the payload (encryption starts here).
    pub payload_start: usize,
    /// One past the last payload byte (signature is appended here).
    pub payload_end: usize,
}

fn check_shape(nm: &NetworkMessage) -> crate::Result<()> {
    let count = nm.messages.len();
    if count == 0 || count > crate::protocol::MAX_DSM_COUNT {
        return Err(StatusCode::BAD_ENCODING_LIMITS_EXCEEDED);
    }
    if nm.payload_header_enabled && nm.dataset_writer_ids.len() != count {
        return Err(StatusCode::BAD_INTERNAL_ERROR);
    }
    if !nm.payload_header_enabled && count != 1 {
        return Err(StatusCode::BAD_ENCODING_ERROR);
    }
    if nm.promoted_fields_enabled && count != 1 {
        // Promoted fields describe a single DataSetMessage.
        return Err(StatusCode::BAD_ENCODING_ERROR);
    }
    if nm.publisher_id_enabled && nm.publisher_id.is_none() {
        return Err(StatusCode::BAD_INTERNAL_ERROR);
    }
    if nm.security_enabled && nm.security_header.nonce.len() > crate::protocol::MAX_NONCE_LENGTH {
        return Err(StatusCode::BAD_ENCODING_LIMITS_EXCEEDED);
    }
    Ok(())
}

fn needs_extended1(nm: &NetworkMessage) -> bool {
    nm.publisher_id.as_ref().is_some_and(|p| p.type_bits() != 0)
        || nm.dataset_class_id_enabled
        || nm.security_enabled
        || nm.timestamp_enabled
        || nm.picoseconds_enabled
        || needs_extended2(nm)
}

fn needs_extended2(nm: &NetworkMessage) -> bool {
    nm.chunk_message || nm.promoted_fields_enabled
}

fn publisher_id_size(pid: &PublisherId) -> usize {
    match pid {
        PublisherId::Byte(_) => 1,
        PublisherId::UInt16(_) => 2,
        PublisherId::UInt32(_) => 4,
        PublisherId::UInt64(_) => 8,
        PublisherId::String(s) => encoding::string_size(s),
    }
}

fn dsm_needs_flags2(h: &DataSetMessageHeader) -> bool {
    h.message_type != DataSetMessageType::KeyFrame || h.timestamp_enabled || h.picoseconds_enabled
}

fn dsm_header_size(h: &DataSetMessageHeader) -> usize {
    let mut size = 1;
    if dsm_needs_flags2(h) {
        size += 1;
    }
    if h.sequence_number_enabled {
        size += 2;
    }
    if h.timestamp_enabled {
        size += 8;
    }
    if h.picoseconds_enabled {
        size += 2;
    }
    if h.status_enabled {
        size += 2;
    }
    if h.config_version_major_enabled {
        size += 4;
    }
    if h.config_version_minor_enabled {
        size += 4;
    }
    size
}

// ============================================================================
// Raw field framing
// ============================================================================

/// Dimensions used for raw array framing: the value's own dimensions, or a
/// single dimension with the element count.
fn raw_dimensions(v: &Variant) -> Option<Vec<u32>> {
    match v {
        Variant::Array { values, dimensions, .. } => Some(
            dimensions.clone().unwrap_or_else(|| vec![values.len() as u32]),
        ),
        _ => None,
    }
}

fn raw_scalar_size(fm: &FieldMetaData, v: &Variant) -> usize {
    let size = encoding::scalar_size(v);
    if fm.max_string_length > 0 {
        if let Variant::String(s) = v {
            return size + (fm.max_string_length as usize).saturating_sub(s.len());
        }
        if let Variant::ByteString(b) = v {
            return size + (fm.max_string_length as usize).saturating_sub(b.len());
        }
    }
    size
}

fn raw_field_size(fm: &FieldMetaData, dv: &crate::types::DataValue) -> crate::Result<usize> {
    let v = dv.value.as_ref().ok_or(StatusCode::BAD_ENCODING_ERROR)?;
    match v {
        Variant::Array { values, .. } => {
            let dims = raw_dimensions(v).unwrap_or_default();
            let mut size = 4 * dims.len();
            for item in values {
                size += raw_scalar_size(fm, item);
            }
            Ok(size)
        }
        scalar => Ok(raw_scalar_size(fm, scalar)),
    }
}

fn encode_raw_scalar(ctx: &mut EncodeCtx, fm: &FieldMetaData, v: &Variant) -> crate::Result<()> {
    let before = ctx.pos();
    encoding::write_scalar(ctx, v)?;
    if fm.max_string_length > 0 && matches!(v, Variant::String(_) | Variant::ByteString(_)) {
        let want = raw_scalar_size(fm, v);
        let written = ctx.pos() - before;
        for _ in written..want {
            ctx.write_u8(0)?;
        }
    }
    Ok(())
}

fn encode_raw_field(
    ctx: &mut EncodeCtx,
    fm: &FieldMetaData,
    dv: &crate::types::DataValue,
) -> crate::Result<()> {
    let v = dv.value.as_ref().ok_or(StatusCode::BAD_ENCODING_ERROR)?;
    match v {
        Variant::Array { values, .. } => {
            let dims = raw_dimensions(v).unwrap_or_default();
            for d in &dims {
                ctx.write_u32(*d)?;
            }
            for item in values {
                encode_raw_scalar(ctx, fm, item)?;
            }
            Ok(())
        }
        scalar => encode_raw_scalar(ctx, fm, scalar),
    }
}

// ============================================================================
// Sizing pass
// ============================================================================

fn dsm_payload_size(
    dsm: &DataSetMessage,
    fields_meta: Option<&EncodingMetaData>,
) -> crate::Result<usize> {
    match (&dsm.payload, dsm.header.field_encoding) {
        (DataSetPayload::KeepAlive, _) => Ok(0),
        (DataSetPayload::KeyFrame(fields), FieldEncoding::Variant) => {
            let mut size = 2;
            for dv in fields {
                size += encoding::variant_size(dv.value.as_ref().unwrap_or(&Variant::Empty));
            }
            Ok(size)
        }
        (DataSetPayload::KeyFrame(fields), FieldEncoding::DataValue) => {
            let mut size = 2;
            for dv in fields {
                size += encoding::data_value_size(dv);
            }
            Ok(size)
        }
        (DataSetPayload::KeyFrame(fields), FieldEncoding::RawData) => {
            let meta = fields_meta.ok_or(StatusCode::BAD_ENCODING_ERROR)?;
            if meta.fields.len() != fields.len() {
                return Err(StatusCode::BAD_ENCODING_ERROR);
            }
            let mut size = 0;
            for (fm, dv) in meta.fields.iter().zip(fields) {
                size += raw_field_size(fm, dv)?;
            }
            Ok(size)
        }
        (DataSetPayload::DeltaFrame(fields), FieldEncoding::Variant) => {
            let mut size = 2;
            for (_, dv) in fields {
                size += 2 + encoding::variant_size(dv.value.as_ref().unwrap_or(&Variant::Empty));
            }
            Ok(size)
        }
        (DataSetPayload::DeltaFrame(fields), FieldEncoding::DataValue) => {
            let mut size = 2;
            for (_, dv) in fields {
                size += 2 + encoding::data_value_size(dv);
            }
            Ok(size)
        }
        (DataSetPayload::DeltaFrame(_), FieldEncoding::RawData) => {
            Err(StatusCode::BAD_NOT_SUPPORTED)
        }
        (DataSetPayload::RawKeyFrame(blob), _) => Ok(blob.len()),
    }
}

fn dsm_size(dsm: &DataSetMessage, meta: Option<&EncodingMetaData>) -> crate::Result<usize> {
    Ok(dsm_header_size(&dsm.header) + dsm_payload_size(dsm, meta)?)
}

/// Exact encoded size of the NetworkMessage, excluding any signature tail.
pub fn calc_size(nm: &NetworkMessage, meta: &[EncodingMetaData]) -> crate::Result<usize> {
    check_shape(nm)?;
    let mut size = 1; // UADPFlags + version
    if needs_extended1(nm) {
        size += 1;
        if needs_extended2(nm) {
            size += 1;
        }
    }
    if nm.publisher_id_enabled {
        size += publisher_id_size(nm.publisher_id.as_ref().expect("checked"));
    }
    if nm.dataset_class_id_enabled {
        size += encoding::GUID_SIZE;
    }
    if nm.group_header_enabled {
        let gh = &nm.group_header;
        size += 1;
        if gh.writer_group_id_enabled {
            size += 2;
        }
        if gh.group_version_enabled {
            size += 4;
        }
        if gh.network_message_number_enabled {
            size += 2;
        }
        if gh.sequence_number_enabled {
            size += 2;
        }
    }
    if nm.payload_header_enabled {
        size += 1 + 2 * nm.dataset_writer_ids.len();
    }
    if nm.timestamp_enabled {
        size += 8;
    }
    if nm.picoseconds_enabled {
        size += 2;
    }
    if nm.promoted_fields_enabled {
        let mut pf = 0;
        for v in &nm.promoted_fields {
            pf += encoding::variant_size(v);
        }
        size += 2 + pf;
    }
    if nm.security_enabled {
        size += 1 + 4 + 1 + nm.security_header.nonce.len();
        if nm.security_header.footer_enabled {
            size += 2;
        }
    }
    if nm.payload_header_enabled && nm.messages.len() > 1 {
        size += 2 * nm.messages.len();
    }
    for (i, dsm) in nm.messages.iter().enumerate() {
        let m = nm.writer_id_at(i).and_then(|id| find_meta(meta, id));
        size += dsm_size(dsm, m)?;
    }
    Ok(size)
}

// ============================================================================
// Write pass
// ============================================================================

struct OffsetSink<'a> {
    table: Option<&'a mut Vec<OffsetEntry>>,
}

impl OffsetSink<'_> {
    fn record(&mut self, kind: OffsetKind, offset: usize, dsm: usize, field: usize) {
        if let Some(table) = self.table.as_deref_mut() {
            table.push(OffsetEntry { kind, offset, dsm, field });
        }
    }
}

fn encode_dsm_header(ctx: &mut EncodeCtx, h: &DataSetMessageHeader, dsm: usize, sink: &mut OffsetSink) -> crate::Result<()> {
    let mut flags1 = (h.field_encoding as u8) << 1;
    if h.valid {
        flags1 |= DSM_FLAG_VALID;
    }
    if h.sequence_number_enabled {
        flags1 |= DSM_FLAG_SEQUENCE_NUMBER;
    }
    if h.status_enabled {
        flags1 |= DSM_FLAG_STATUS;
    }
    if h.config_version_major_enabled {
        flags1 |= DSM_FLAG_CFG_MAJOR;
    }
    if h.config_version_minor_enabled {
        flags1 |= DSM_FLAG_CFG_MINOR;
    }
    if dsm_needs_flags2(h) {
        flags1 |= DSM_FLAG_FLAGS2;
    }
    ctx.write_u8(flags1)?;
    if dsm_needs_flags2(h) {
        let mut flags2 = h.message_type as u8;
        if h.timestamp_enabled {
            flags2 |= DSM2_TIMESTAMP;
        }
        if h.picoseconds_enabled {
            flags2 |= DSM2_PICOSECONDS;
        }
        ctx.write_u8(flags2)?;
    }
    if h.sequence_number_enabled {
        sink.record(OffsetKind::DataSetMessageSequenceNumber, ctx.pos(), dsm, 0);
        ctx.write_u16(h.sequence_number)?;
    }
    if h.timestamp_enabled {
        sink.record(OffsetKind::DataSetMessageTimestamp, ctx.pos(), dsm, 0);
        ctx.write_i64(h.timestamp.0)?;
    }
    if h.picoseconds_enabled {
        ctx.write_u16(h.picoseconds)?;
    }
    if h.status_enabled {
        sink.record(OffsetKind::DataSetMessageStatus, ctx.pos(), dsm, 0);
        ctx.write_u16(h.status)?;
    }
    if h.config_version_major_enabled {
        ctx.write_u32(h.config_version_major)?;
    }
    if h.config_version_minor_enabled {
        ctx.write_u32(h.config_version_minor)?;
    }
    Ok(())
}

fn encode_dsm(
    ctx: &mut EncodeCtx,
    dsm_index: usize,
    dsm: &DataSetMessage,
    meta: Option<&EncodingMetaData>,
    sink: &mut OffsetSink,
) -> crate::Result<()> {
    encode_dsm_header(ctx, &dsm.header, dsm_index, sink)?;
    match (&dsm.payload, dsm.header.field_encoding) {
        (DataSetPayload::KeepAlive, _) => Ok(()),
        (DataSetPayload::KeyFrame(fields), FieldEncoding::Variant) => {
            ctx.write_u16(fields.len() as u16)?;
            for (fi, dv) in fields.iter().enumerate() {
                sink.record(OffsetKind::DataSetFieldVariant, ctx.pos(), dsm_index, fi);
                encoding::write_variant(ctx, dv.value.as_ref().unwrap_or(&Variant::Empty))?;
            }
            Ok(())
        }
        (DataSetPayload::KeyFrame(fields), FieldEncoding::DataValue) => {
            ctx.write_u16(fields.len() as u16)?;
            for (fi, dv) in fields.iter().enumerate() {
                sink.record(OffsetKind::DataSetFieldDataValue, ctx.pos(), dsm_index, fi);
                encoding::write_data_value(ctx, dv)?;
            }
            Ok(())
        }
        (DataSetPayload::KeyFrame(fields), FieldEncoding::RawData) => {
            let meta = meta.ok_or(StatusCode::BAD_ENCODING_ERROR)?;
            if meta.fields.len() != fields.len() {
                return Err(StatusCode::BAD_ENCODING_ERROR);
            }
            for (fi, (fm, dv)) in meta.fields.iter().zip(fields).enumerate() {
                sink.record(OffsetKind::DataSetFieldRaw, ctx.pos(), dsm_index, fi);
                encode_raw_field(ctx, fm, dv)?;
            }
            Ok(())
        }
        (DataSetPayload::DeltaFrame(fields), enc) => {
            if enc == FieldEncoding::RawData {
                return Err(StatusCode::BAD_NOT_SUPPORTED);
            }
            ctx.write_u16(fields.len() as u16)?;
            for (index, dv) in fields {
                ctx.write_u16(*index)?;
                match enc {
                    FieldEncoding::Variant => {
                        encoding::write_variant(ctx, dv.value.as_ref().unwrap_or(&Variant::Empty))?;
                    }
                    FieldEncoding::DataValue => encoding::write_data_value(ctx, dv)?,
                    FieldEncoding::RawData => unreachable!(),
                }
            }
            Ok(())
        }
        (DataSetPayload::RawKeyFrame(blob), _) => ctx.write_bytes(blob),
    }
}

/// Encode `nm` into `buf`. The buffer length must equal
/// `calc_size(nm, meta)` plus the signature size when signing.
pub fn encode(
    nm: &NetworkMessage,
    meta: &[EncodingMetaData],
    buf: &mut [u8],
    offsets: Option<&mut Vec<OffsetEntry>>,
) -> crate::Result<EncodedLayout> {
    check_shape(nm)?;
    let mut sink = OffsetSink { table: offsets };
    let mut ctx = EncodeCtx::new(buf);

    // --- Headers ---
    let mut flags = nm.version & 0x0F;
    if nm.publisher_id_enabled {
        flags |= NM_FLAG_PUBLISHER_ID;
    }
    if nm.group_header_enabled {
        flags |= NM_FLAG_GROUP_HEADER;
    }
    if nm.payload_header_enabled {
        flags |= NM_FLAG_PAYLOAD_HEADER;
    }
    let ext1 = needs_extended1(nm);
    if ext1 {
        flags |= NM_FLAG_EXTENDED1;
    }
    ctx.write_u8(flags)?;

    if ext1 {
        let mut e1 = nm.publisher_id.as_ref().map_or(0, PublisherId::type_bits);
        if nm.dataset_class_id_enabled {
            e1 |= EXT1_DATASET_CLASS_ID;
        }
        if nm.security_enabled {
            e1 |= EXT1_SECURITY;
        }
        if nm.timestamp_enabled {
            e1 |= EXT1_TIMESTAMP;
        }
        if nm.picoseconds_enabled {
            e1 |= EXT1_PICOSECONDS;
        }
        if needs_extended2(nm) {
            e1 |= EXT1_EXTENDED2;
        }
        ctx.write_u8(e1)?;
        if needs_extended2(nm) {
            let mut e2 = 0u8;
            if nm.chunk_message {
                e2 |= EXT2_CHUNK;
            }
            if nm.promoted_fields_enabled {
                e2 |= EXT2_PROMOTED_FIELDS;
            }
            ctx.write_u8(e2)?;
        }
    }

    if nm.publisher_id_enabled {
        match nm.publisher_id.as_ref().expect("checked") {
            PublisherId::Byte(v) => ctx.write_u8(*v)?,
            PublisherId::UInt16(v) => ctx.write_u16(*v)?,
            PublisherId::UInt32(v) => ctx.write_u32(*v)?,
            PublisherId::UInt64(v) => ctx.write_u64(*v)?,
            PublisherId::String(s) => encoding::write_string(&mut ctx, s)?,
        }
    }

    if nm.dataset_class_id_enabled {
        encoding::write_guid(&mut ctx, &nm.dataset_class_id)?;
    }

    if nm.group_header_enabled {
        let gh = &nm.group_header;
        let mut gf = 0u8;
        if gh.writer_group_id_enabled {
            gf |= GROUP_FLAG_WRITER_GROUP_ID;
        }
        if gh.group_version_enabled {
            gf |= GROUP_FLAG_GROUP_VERSION;
        }
        if gh.network_message_number_enabled {
            gf |= GROUP_FLAG_NM_NUMBER;
        }
        if gh.sequence_number_enabled {
            gf |= GROUP_FLAG_SEQUENCE_NUMBER;
        }
        ctx.write_u8(gf)?;
        if gh.writer_group_id_enabled {
            ctx.write_u16(gh.writer_group_id)?;
        }
        if gh.group_version_enabled {
            ctx.write_u32(gh.group_version)?;
        }
        if gh.network_message_number_enabled {
            ctx.write_u16(gh.network_message_number)?;
        }
        if gh.sequence_number_enabled {
            sink.record(OffsetKind::NetworkMessageSequenceNumber, ctx.pos(), 0, 0);
            ctx.write_u16(gh.sequence_number)?;
        }
    }

    if nm.payload_header_enabled {
        ctx.write_u8(nm.dataset_writer_ids.len() as u8)?;
        for id in &nm.dataset_writer_ids {
            ctx.write_u16(*id)?;
        }
    }

    if nm.timestamp_enabled {
        sink.record(OffsetKind::NetworkMessageTimestamp, ctx.pos(), 0, 0);
        ctx.write_i64(nm.timestamp.0)?;
    }
    if nm.picoseconds_enabled {
        sink.record(OffsetKind::NetworkMessagePicoseconds, ctx.pos(), 0, 0);
        ctx.write_u16(nm.picoseconds)?;
    }

    if nm.promoted_fields_enabled {
        let mut pf_size = 0;
        for v in &nm.promoted_fields {
            pf_size += encoding::variant_size(v);
        }
        ctx.write_u16(pf_size as u16)?;
        for v in &nm.promoted_fields {
            encoding::write_variant(&mut ctx, v)?;
        }
    }

    if nm.security_enabled {
        let sh = &nm.security_header;
        let mut sf = 0u8;
        if sh.message_signed {
            sf |= SEC_FLAG_SIGNED;
        }
        if sh.message_encrypted {
            sf |= SEC_FLAG_ENCRYPTED;
        }
        if sh.footer_enabled {
            sf |= SEC_FLAG_FOOTER;
        }
        if sh.force_key_reset {
            sf |= SEC_FLAG_KEY_RESET;
        }
        ctx.write_u8(sf)?;
        ctx.write_u32(sh.token_id)?;
        ctx.write_u8(sh.nonce.len() as u8)?;
        ctx.write_bytes(&sh.nonce)?;
        if sh.footer_enabled {
            ctx.write_u16(0)?;
        }
    }

    // --- Payload ---
    let payload_start = ctx.pos();

    if nm.payload_header_enabled && nm.messages.len() > 1 {
        for (i, dsm) in nm.messages.iter().enumerate() {
            let m = nm.writer_id_at(i).and_then(|id| find_meta(meta, id));
            ctx.write_u16(dsm_size(dsm, m)? as u16)?;
        }
    }

    for (i, dsm) in nm.messages.iter().enumerate() {
        let m = nm.writer_id_at(i).and_then(|id| find_meta(meta, id));
        encode_dsm(&mut ctx, i, dsm, m, &mut sink)?;
    }

    Ok(EncodedLayout { payload_start, payload_end: ctx.pos() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataValue, DateTime};

    fn simple_nm() -> NetworkMessage {
        let mut nm = NetworkMessage::new();
        nm.publisher_id_enabled = true;
        nm.publisher_id = Some(PublisherId::UInt16(2234));
        nm.group_header_enabled = true;
        nm.group_header.writer_group_id_enabled = true;
        nm.group_header.writer_group_id = 100;
        nm.group_header.sequence_number_enabled = true;
        nm.group_header.sequence_number = 7;
        nm.payload_header_enabled = true;
        nm.dataset_writer_ids = vec![62541];
        nm.messages = vec![DataSetMessage {
            header: DataSetMessageHeader {
                valid: true,
                field_encoding: FieldEncoding::Variant,
                sequence_number_enabled: true,
                sequence_number: 3,
                ..Default::default()
            },
            payload: DataSetPayload::KeyFrame(vec![DataValue::from_variant(
                crate::types::Variant::UInt32(42),
            )]),
        }];
        nm
    }

    #[test]
    fn test_size_matches_write() {
        let nm = simple_nm();
        let size = calc_size(&nm, &[]).expect("size");
        let mut buf = vec![0u8; size];
        let layout = encode(&nm, &[], &mut buf, None).expect("encode");
        assert_eq!(layout.payload_end, size);
        assert!(layout.payload_start < layout.payload_end);
    }

    #[test]
    fn test_header_bits() {
        let nm = simple_nm();
        let size = calc_size(&nm, &[]).expect("size");
        let mut buf = vec![0u8; size];
        encode(&nm, &[], &mut buf, None).expect("encode");
        // version 1, publisherId, groupHeader, payloadHeader, extended1 (u16 pid)
        assert_eq!(buf[0], 0x01 | 0x10 | 0x20 | 0x40 | 0x80);
        // extendedFlags1: publisherId type UInt16
        assert_eq!(buf[1], 0x01);
        // publisherId value
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 2234);
        // groupFlags: writerGroupId + sequenceNumber
        assert_eq!(buf[4], 0x01 | 0x08);
    }

    #[test]
    fn test_offset_table_points_at_sequence_numbers() {
        let mut nm = simple_nm();
        nm.timestamp_enabled = true;
        nm.timestamp = DateTime(1234);
        let size = calc_size(&nm, &[]).expect("size");
        let mut buf = vec![0u8; size];
        let mut table = Vec::new();
        encode(&nm, &[], &mut buf, Some(&mut table)).expect("encode");

        let nm_seq = table
            .iter()
            .find(|e| e.kind == OffsetKind::NetworkMessageSequenceNumber)
            .expect("nm seq offset");
        assert_eq!(u16::from_le_bytes([buf[nm_seq.offset], buf[nm_seq.offset + 1]]), 7);

        let ts = table
            .iter()
            .find(|e| e.kind == OffsetKind::NetworkMessageTimestamp)
            .expect("ts offset");
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[ts.offset..ts.offset + 8]);
        assert_eq!(i64::from_le_bytes(b), 1234);

        let dsm_seq = table
            .iter()
            .find(|e| e.kind == OffsetKind::DataSetMessageSequenceNumber)
            .expect("dsm seq offset");
        assert_eq!(u16::from_le_bytes([buf[dsm_seq.offset], buf[dsm_seq.offset + 1]]), 3);

        assert!(table.iter().any(|e| e.kind == OffsetKind::DataSetFieldVariant));
    }

    #[test]
    fn test_rejects_inconsistent_payload_header() {
        let mut nm = simple_nm();
        nm.dataset_writer_ids = vec![1, 2];
        assert!(calc_size(&nm, &[]).is_err());
    }

    #[test]
    fn test_raw_requires_metadata() {
        let mut nm = simple_nm();
        nm.messages[0].header.field_encoding = FieldEncoding::RawData;
        assert!(calc_size(&nm, &[]).is_err());

        let meta = vec![EncodingMetaData {
            dataset_writer_id: 62541,
            fields: vec![FieldMetaData {
                name: "f".into(),
                built_in_type: crate::types::BuiltInType::UInt32 as u8,
                value_rank: -1,
                ..Default::default()
            }],
        }];
        let size = calc_size(&nm, &meta).expect("size with metadata");
        let mut buf = vec![0u8; size];
        encode(&nm, &meta, &mut buf, None).expect("encode raw");
        // raw keyframe omits the field count: header (flags1 + seq) + 4 bytes
        assert_eq!(size, 1 + 2 + 4 + header_overhead(&nm));
    }

    fn header_overhead(nm: &NetworkMessage) -> usize {
        // everything before the DSM for simple_nm-based messages
        let mut s = 1 + 1; // flags + ext1
        s += 2; // publisher id u16
        s += 1 + 2 + 2; // group flags + wgId + seq
        s += 1 + 2; // payload header count + one writer id
        s
    }
}
