// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary configuration file load/save.
//!
//! The file is a single ExtensionObject-encoded `UABinaryFileDataType`
//! wrapping a `PubSubConfigurationDataType` (Part 14 Section 6.2.12):
//! arrays of PublishedDataSets and Connections with their nested groups,
//! writers and readers. Loading replaces the entire manager state; saving
//! re-encodes the live state.

use super::*;
use crate::host::AttributeId;
use crate::protocol::{ConfigurationVersion, DataSetMetaData, FieldMetaData, PublisherId};
use crate::security::SecurityMode;
use crate::types::encoding::{self, DecodeCtx, EncodeCtx};
use crate::types::{
    ExtensionObject, ExtensionObjectBody, Guid, KeyValuePair, LocalizedText, NodeId, StatusCode,
    Variant,
};

// DefaultBinary encoding node ids of the config DataTypes (OPC UA NodeSet).
const ID_UABINARYFILE: u32 = 15422;
const ID_PUBSUB_CONFIGURATION: u32 = 21154;
const ID_PUBLISHED_DATA_ITEMS: u32 = 15679;
const ID_NETWORK_ADDRESS_URL: u32 = 21152;
const ID_UADP_WRITER_GROUP_MESSAGE: u32 = 21193;
const ID_UADP_DATASET_WRITER_MESSAGE: u32 = 21221;
const ID_BROKER_WRITER_GROUP_TRANSPORT: u32 = 15727;
const ID_BROKER_READER_GROUP_TRANSPORT: u32 = 15733;
const ID_TARGET_VARIABLES: u32 = 15712;

// ============================================================================
// Growable encode buffer
// ============================================================================

/// The config encoder does not pre-size; it encodes pieces into scratch
/// buffers and concatenates.
struct Out {
    buf: Vec<u8>,
}

impl Out {
    fn new() -> Self {
        Out { buf: Vec::with_capacity(512) }
    }

    fn put<F>(&mut self, size: usize, f: F) -> crate::Result<()>
    where
        F: FnOnce(&mut EncodeCtx) -> crate::Result<()>,
    {
        let start = self.buf.len();
        self.buf.resize(start + size, 0);
        let mut ctx = EncodeCtx::new(&mut self.buf[start..]);
        f(&mut ctx)?;
        let written = ctx.pos();
        self.buf.truncate(start + written);
        Ok(())
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn boolean(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    fn string(&mut self, s: &str) -> crate::Result<()> {
        self.put(encoding::string_size(s), |ctx| encoding::write_string(ctx, s))
    }

    fn localized_text(&mut self, lt: &LocalizedText) -> crate::Result<()> {
        self.put(encoding::localized_text_size(lt), |ctx| encoding::write_localized_text(ctx, lt))
    }

    fn node_id(&mut self, id: &NodeId) -> crate::Result<()> {
        self.put(encoding::node_id_size(id), |ctx| encoding::write_node_id(ctx, id))
    }

    fn guid(&mut self, g: &Guid) -> crate::Result<()> {
        self.put(encoding::GUID_SIZE, |ctx| encoding::write_guid(ctx, g))
    }

    fn variant(&mut self, v: &Variant) -> crate::Result<()> {
        self.put(encoding::variant_size(v), |ctx| encoding::write_variant(ctx, v))
    }

    fn key_value_pairs(&mut self, kvs: &[KeyValuePair]) -> crate::Result<()> {
        self.i32(kvs.len() as i32);
        for kv in kvs {
            self.put(encoding::qualified_name_size(&kv.key), |ctx| {
                encoding::write_qualified_name(ctx, &kv.key)
            })?;
            self.variant(&kv.value)?;
        }
        Ok(())
    }

    fn string_array(&mut self, items: &[String]) -> crate::Result<()> {
        self.i32(items.len() as i32);
        for s in items {
            self.string(s)?;
        }
        Ok(())
    }

    fn extension_object(&mut self, type_id: u32, body: Option<Vec<u8>>) -> crate::Result<()> {
        self.node_id(&NodeId::ns0(type_id))?;
        match body {
            None => self.u8(0x00),
            Some(bytes) => {
                self.u8(0x01);
                self.i32(bytes.len() as i32);
                self.buf.extend_from_slice(&bytes);
            }
        }
        Ok(())
    }

    /// An absent ExtensionObject (null type id, no body).
    fn null_extension_object(&mut self) -> crate::Result<()> {
        self.node_id(&NodeId::NULL)?;
        self.u8(0x00);
        Ok(())
    }
}

fn publisher_id_variant(pid: &PublisherId) -> Variant {
    match pid {
        PublisherId::Byte(v) => Variant::Byte(*v),
        PublisherId::UInt16(v) => Variant::UInt16(*v),
        PublisherId::UInt32(v) => Variant::UInt32(*v),
        PublisherId::UInt64(v) => Variant::UInt64(*v),
        PublisherId::String(s) => Variant::String(s.clone()),
    }
}

fn publisher_id_from_variant(v: &Variant) -> crate::Result<PublisherId> {
    Ok(match v {
        Variant::Byte(x) => PublisherId::Byte(*x),
        Variant::UInt16(x) => PublisherId::UInt16(*x),
        Variant::UInt32(x) => PublisherId::UInt32(*x),
        Variant::UInt64(x) => PublisherId::UInt64(*x),
        Variant::String(s) => PublisherId::String(s.clone()),
        _ => return Err(StatusCode::BAD_TYPE_MISMATCH),
    })
}

// ============================================================================
// Encode (save)
// ============================================================================

fn encode_field_meta(out: &mut Out, fm: &FieldMetaData) -> crate::Result<()> {
    out.string(&fm.name)?;
    out.localized_text(&fm.description)?;
    out.u16(fm.field_flags);
    out.u8(fm.built_in_type);
    out.node_id(&fm.data_type)?;
    out.i32(fm.value_rank);
    out.i32(fm.array_dimensions.len() as i32);
    for d in &fm.array_dimensions {
        out.u32(*d);
    }
    out.u32(fm.max_string_length);
    out.guid(&fm.dataset_field_id)?;
    out.key_value_pairs(&fm.properties)
}

fn encode_metadata(out: &mut Out, md: &DataSetMetaData) -> crate::Result<()> {
    out.string_array(&[])?; // namespaces
    out.i32(0); // structureDataTypes
    out.i32(0); // enumDataTypes
    out.i32(0); // simpleDataTypes
    out.string(&md.name)?;
    out.localized_text(&md.description)?;
    out.i32(md.fields.len() as i32);
    for fm in &md.fields {
        encode_field_meta(out, fm)?;
    }
    out.guid(&md.dataset_class_id)?;
    out.u32(md.configuration_version.major);
    out.u32(md.configuration_version.minor);
    Ok(())
}

fn encode_published_dataset(out: &mut Out, pds: &PublishedDataSet) -> crate::Result<()> {
    out.string(&pds.config.name)?;
    out.string_array(&[])?; // dataSetFolder
    encode_metadata(out, &pds.metadata)?;
    out.key_value_pairs(&[])?; // extensionFields

    // dataSetSource: PublishedDataItemsDataType
    let mut src = Out::new();
    src.i32(pds.fields.len() as i32);
    for field in &pds.fields {
        let pp = &field.config.publish_parameters;
        src.node_id(&pp.published_variable)?;
        src.u32(pp.attribute_id as u32);
        src.f64(pp.sampling_interval_hint_ms);
        src.u32(0); // deadbandType
        src.f64(0.0); // deadbandValue
        src.string(&pp.index_range)?;
        src.variant(&Variant::Empty)?; // substituteValue
        src.i32(0); // metaDataProperties
    }
    out.extension_object(ID_PUBLISHED_DATA_ITEMS, Some(src.buf))
}

fn encode_writer_group(psm: &Psm, out: &mut Out, wg: &WriterGroup) -> crate::Result<()> {
    let cfg = &wg.config;
    out.string(&cfg.name)?;
    out.boolean(wg.head.state.is_enabled());
    out.i32(cfg.security_mode.to_wire());
    out.string(&cfg.security_group_id)?;
    out.i32(0); // securityKeyServices
    out.u32(0); // maxNetworkMessageSize
    out.key_value_pairs(&[])?; // groupProperties
    out.u16(cfg.writer_group_id);
    out.f64(cfg.publishing_interval_ms);
    out.f64(cfg.keep_alive_time_ms);
    out.u8(cfg.priority);
    out.string_array(&[])?; // localeIds
    out.string("")?; // headerLayoutUri

    match &cfg.transport_settings {
        WriterGroupTransportSettings::Broker { queue_name } => {
            let mut ts = Out::new();
            ts.string(queue_name)?;
            ts.string("")?; // resourceUri
            ts.string("")?; // authenticationProfileUri
            ts.i32(0); // requestedDeliveryGuarantee
            out.extension_object(ID_BROKER_WRITER_GROUP_TRANSPORT, Some(ts.buf))?;
        }
        // Unicast targets have no wire DataType; re-add them by API.
        _ => out.null_extension_object()?,
    }

    let mut ms = Out::new();
    ms.u32(cfg.message_settings.group_version);
    ms.i32(0); // dataSetOrdering
    ms.u32(cfg.message_settings.content_mask);
    ms.f64(0.0); // samplingOffset
    ms.i32(0); // publishingOffset
    out.extension_object(ID_UADP_WRITER_GROUP_MESSAGE, Some(ms.buf))?;

    out.i32(wg.writers.len() as i32);
    for w in &wg.writers {
        let dsw = psm.dataset_writers.get(w).ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
        encode_dataset_writer(psm, out, dsw)?;
    }
    Ok(())
}

fn encode_dataset_writer(psm: &Psm, out: &mut Out, dsw: &DataSetWriter) -> crate::Result<()> {
    let cfg = &dsw.config;
    out.string(&cfg.name)?;
    out.boolean(dsw.head.state.is_enabled());
    out.u16(cfg.dataset_writer_id);
    out.u32(cfg.field_content_mask);
    out.u32(cfg.key_frame_count);
    let dataset_name = dsw
        .published_dataset
        .and_then(|p| psm.published_datasets.get(&p))
        .map(|pds| pds.config.name.clone())
        .unwrap_or_default();
    out.string(&dataset_name)?;
    out.key_value_pairs(&[])?; // dataSetWriterProperties
    out.null_extension_object()?; // transportSettings

    let mut ms = Out::new();
    ms.u32(cfg.message_settings.dataset_message_content_mask);
    ms.u16(cfg.message_settings.configured_size);
    ms.u16(cfg.message_settings.network_message_number);
    ms.u16(cfg.message_settings.dataset_offset);
    out.extension_object(ID_UADP_DATASET_WRITER_MESSAGE, Some(ms.buf))
}

fn encode_reader_group(psm: &Psm, out: &mut Out, rg: &ReaderGroup) -> crate::Result<()> {
    let cfg = &rg.config;
    out.string(&cfg.name)?;
    out.boolean(rg.head.state.is_enabled());
    out.i32(cfg.security_mode.to_wire());
    out.string(&cfg.security_group_id)?;
    out.i32(0); // securityKeyServices
    out.u32(0); // maxNetworkMessageSize
    out.key_value_pairs(&[])?; // groupProperties

    match &cfg.transport_settings {
        ReaderGroupTransportSettings::Broker { queue_name } => {
            let mut ts = Out::new();
            ts.string(queue_name)?;
            ts.string("")?;
            ts.string("")?;
            ts.i32(0);
            out.extension_object(ID_BROKER_READER_GROUP_TRANSPORT, Some(ts.buf))?;
        }
        ReaderGroupTransportSettings::None => out.null_extension_object()?,
    }
    out.null_extension_object()?; // messageSettings

    out.i32(rg.readers.len() as i32);
    for r in &rg.readers {
        let dsr = psm.dataset_readers.get(r).ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
        encode_dataset_reader(out, dsr)?;
    }
    Ok(())
}

fn encode_dataset_reader(out: &mut Out, dsr: &DataSetReader) -> crate::Result<()> {
    let cfg = &dsr.config;
    out.string(&cfg.name)?;
    out.boolean(dsr.head.state.is_enabled());
    out.variant(&publisher_id_variant(&cfg.publisher_id))?;
    out.u16(cfg.writer_group_id);
    out.u16(cfg.dataset_writer_id);
    encode_metadata(out, &cfg.dataset_metadata)?;
    out.u32(0); // dataSetFieldContentMask
    out.f64(cfg.message_receive_timeout_ms);
    out.u32(0); // keyFrameCount
    out.string("")?; // headerLayoutUri
    out.i32(SecurityMode::None.to_wire());
    out.string("")?; // securityGroupId
    out.i32(0); // securityKeyServices
    out.null_extension_object()?; // transportSettings
    out.null_extension_object()?; // messageSettings

    // subscribedDataSet: TargetVariablesDataType
    let mut sds = Out::new();
    sds.i32(cfg.target_variables.len() as i32);
    for tv in &cfg.target_variables {
        sds.guid(&tv.dataset_field_id)?;
        sds.string(&tv.receiver_index_range)?;
        sds.node_id(&tv.target_node_id)?;
        sds.u32(tv.attribute_id as u32);
        sds.string("")?; // writeIndexRange
        sds.i32(0); // overrideValueHandling
        sds.variant(&Variant::Empty)?; // overrideValue
    }
    out.extension_object(ID_TARGET_VARIABLES, Some(sds.buf))
}

fn encode_connection(psm: &Psm, out: &mut Out, c: &Connection) -> crate::Result<()> {
    out.string(&c.config.name)?;
    out.boolean(c.head.state.is_enabled());
    out.variant(&publisher_id_variant(&c.publisher_id))?;
    out.string(&c.config.transport_profile_uri)?;

    let mut addr = Out::new();
    addr.string(&c.config.address.network_interface)?;
    addr.string(&c.config.address.url)?;
    out.extension_object(ID_NETWORK_ADDRESS_URL, Some(addr.buf))?;

    out.key_value_pairs(&c.config.connection_properties)?;
    out.null_extension_object()?; // transportSettings

    out.i32(c.writer_groups.len() as i32);
    for wg in &c.writer_groups {
        let wg = psm.writer_groups.get(wg).ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
        encode_writer_group(psm, out, wg)?;
    }
    out.i32(c.reader_groups.len() as i32);
    for rg in &c.reader_groups {
        let rg = psm.reader_groups.get(rg).ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
        encode_reader_group(psm, out, rg)?;
    }
    Ok(())
}

// ============================================================================
// Decode (load) into plain configuration lists
// ============================================================================

struct LoadedField {
    cfg: DataSetFieldConfig,
}

struct LoadedDataSet {
    cfg: PublishedDataSetConfig,
    fields: Vec<LoadedField>,
}

struct LoadedWriter {
    enabled: bool,
    dataset_name: String,
    cfg: DataSetWriterConfig,
}

struct LoadedWriterGroup {
    enabled: bool,
    cfg: WriterGroupConfig,
    writers: Vec<LoadedWriter>,
}

struct LoadedReader {
    enabled: bool,
    cfg: DataSetReaderConfig,
}

struct LoadedReaderGroup {
    enabled: bool,
    cfg: ReaderGroupConfig,
    readers: Vec<LoadedReader>,
}

struct LoadedConnection {
    enabled: bool,
    cfg: PubSubConnectionConfig,
    writer_groups: Vec<LoadedWriterGroup>,
    reader_groups: Vec<LoadedReaderGroup>,
}

struct LoadedConfig {
    datasets: Vec<LoadedDataSet>,
    connections: Vec<LoadedConnection>,
    enabled: bool,
}

fn read_array_len(ctx: &mut DecodeCtx) -> crate::Result<usize> {
    let len = ctx.read_i32()?;
    let len = if len < 0 { 0 } else { len as usize };
    if len > ctx.remaining() {
        return Err(StatusCode::BAD_DECODING_ERROR);
    }
    Ok(len)
}

fn read_key_value_pairs(ctx: &mut DecodeCtx) -> crate::Result<Vec<KeyValuePair>> {
    let len = read_array_len(ctx)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let key = encoding::read_qualified_name(ctx)?;
        let value = encoding::read_variant(ctx)?;
        out.push(KeyValuePair { key, value });
    }
    Ok(out)
}

fn skip_string_array(ctx: &mut DecodeCtx) -> crate::Result<Vec<String>> {
    let len = read_array_len(ctx)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(encoding::read_string(ctx)?);
    }
    Ok(out)
}

/// Expect an ExtensionObject of a given encoding id; returns its body.
fn read_extension_body(ctx: &mut DecodeCtx, expected: u32) -> crate::Result<Option<Vec<u8>>> {
    let eo = encoding::read_extension_object(ctx)?;
    match eo.body {
        ExtensionObjectBody::None => Ok(None),
        ExtensionObjectBody::ByteString(bytes) => {
            if eo.type_id != NodeId::ns0(expected) {
                return Err(StatusCode::BAD_TYPE_MISMATCH);
            }
            Ok(Some(bytes))
        }
    }
}

/// An ExtensionObject whose type may be one of several; returns (id, body).
fn read_any_extension(ctx: &mut DecodeCtx) -> crate::Result<(NodeId, Option<Vec<u8>>)> {
    let eo = encoding::read_extension_object(ctx)?;
    let body = match eo.body {
        ExtensionObjectBody::None => None,
        ExtensionObjectBody::ByteString(bytes) => Some(bytes),
    };
    Ok((eo.type_id, body))
}

fn decode_field_meta(ctx: &mut DecodeCtx) -> crate::Result<FieldMetaData> {
    let name = encoding::read_string(ctx)?;
    let description = encoding::read_localized_text(ctx)?;
    let field_flags = ctx.read_u16()?;
    let built_in_type = ctx.read_u8()?;
    let data_type = encoding::read_node_id(ctx)?;
    let value_rank = ctx.read_i32()?;
    let dims_len = read_array_len(ctx)?;
    let mut array_dimensions = Vec::with_capacity(dims_len);
    for _ in 0..dims_len {
        array_dimensions.push(ctx.read_u32()?);
    }
    let max_string_length = ctx.read_u32()?;
    let dataset_field_id = encoding::read_guid(ctx)?;
    let properties = read_key_value_pairs(ctx)?;
    Ok(FieldMetaData {
        name,
        description,
        field_flags,
        built_in_type,
        data_type,
        value_rank,
        array_dimensions,
        max_string_length,
        dataset_field_id,
        properties,
    })
}

fn decode_metadata(ctx: &mut DecodeCtx) -> crate::Result<DataSetMetaData> {
    skip_string_array(ctx)?; // namespaces
    for _ in 0..3 {
        // structure/enum/simple DataType descriptions are not used
        let len = read_array_len(ctx)?;
        if len != 0 {
            return Err(StatusCode::BAD_NOT_SUPPORTED);
        }
    }
    let name = encoding::read_string(ctx)?;
    let description = encoding::read_localized_text(ctx)?;
    let fields_len = read_array_len(ctx)?;
    let mut fields = Vec::with_capacity(fields_len);
    for _ in 0..fields_len {
        fields.push(decode_field_meta(ctx)?);
    }
    let dataset_class_id = encoding::read_guid(ctx)?;
    let configuration_version =
        ConfigurationVersion { major: ctx.read_u32()?, minor: ctx.read_u32()? };
    Ok(DataSetMetaData { name, description, fields, dataset_class_id, configuration_version })
}

fn decode_published_dataset(ctx: &mut DecodeCtx) -> crate::Result<LoadedDataSet> {
    let name = encoding::read_string(ctx)?;
    skip_string_array(ctx)?; // dataSetFolder
    let metadata = decode_metadata(ctx)?;
    read_key_value_pairs(ctx)?; // extensionFields

    let body = read_extension_body(ctx, ID_PUBLISHED_DATA_ITEMS)?
        .ok_or(StatusCode::BAD_TYPE_MISMATCH)?;
    let mut src = DecodeCtx::new(&body);
    let count = read_array_len(&mut src)?;
    if count != metadata.fields.len() {
        return Err(StatusCode::BAD_DECODING_ERROR);
    }
    let mut fields = Vec::with_capacity(count);
    for fm in metadata.fields.iter().take(count) {
        let published_variable = encoding::read_node_id(&mut src)?;
        let attribute_id = AttributeId::from_u32(src.read_u32()?)
            .ok_or(StatusCode::BAD_ATTRIBUTE_ID_INVALID)?;
        let sampling_interval_hint_ms = src.read_f64()?;
        let _deadband_type = src.read_u32()?;
        let _deadband_value = src.read_f64()?;
        let index_range = encoding::read_string(&mut src)?;
        let _substitute = encoding::read_variant(&mut src)?;
        let props = read_array_len(&mut src)?;
        for _ in 0..props {
            encoding::read_qualified_name(&mut src)?;
        }
        fields.push(LoadedField {
            cfg: DataSetFieldConfig {
                field_name_alias: fm.name.clone(),
                promoted_field: fm.is_promoted(),
                publish_parameters: PublishedVariable {
                    published_variable,
                    attribute_id,
                    index_range,
                    sampling_interval_hint_ms,
                },
                max_string_length: fm.max_string_length,
            },
        });
    }

    Ok(LoadedDataSet {
        cfg: PublishedDataSetConfig { name, dataset_type: PublishedDataSetType::Items },
        fields,
    })
}

fn decode_writer_group(ctx: &mut DecodeCtx) -> crate::Result<LoadedWriterGroup> {
    let name = encoding::read_string(ctx)?;
    let enabled = ctx.read_u8()? != 0;
    let security_mode = SecurityMode::from_wire(ctx.read_i32()?);
    let security_group_id = encoding::read_string(ctx)?;
    let sks_len = read_array_len(ctx)?;
    if sks_len != 0 {
        return Err(StatusCode::BAD_NOT_SUPPORTED);
    }
    let _max_nm_size = ctx.read_u32()?;
    read_key_value_pairs(ctx)?; // groupProperties
    let writer_group_id = ctx.read_u16()?;
    let publishing_interval_ms = ctx.read_f64()?;
    let keep_alive_time_ms = ctx.read_f64()?;
    let priority = ctx.read_u8()?;
    skip_string_array(ctx)?; // localeIds
    encoding::read_string(ctx)?; // headerLayoutUri

    let (ts_id, ts_body) = read_any_extension(ctx)?;
    let transport_settings = match ts_body {
        Some(body) if ts_id == NodeId::ns0(ID_BROKER_WRITER_GROUP_TRANSPORT) => {
            let mut ts = DecodeCtx::new(&body);
            let queue_name = encoding::read_string(&mut ts)?;
            WriterGroupTransportSettings::Broker { queue_name }
        }
        _ => WriterGroupTransportSettings::None,
    };

    let mut message_settings = UadpWriterGroupMessageSettings::default();
    if let Some(body) = read_extension_body(ctx, ID_UADP_WRITER_GROUP_MESSAGE)? {
        let mut ms = DecodeCtx::new(&body);
        message_settings.group_version = ms.read_u32()?;
        let _ordering = ms.read_i32()?;
        message_settings.content_mask = ms.read_u32()?;
    }

    let writers_len = read_array_len(ctx)?;
    let mut writers = Vec::with_capacity(writers_len);
    for _ in 0..writers_len {
        writers.push(decode_dataset_writer(ctx)?);
    }

    Ok(LoadedWriterGroup {
        enabled,
        cfg: WriterGroupConfig {
            name,
            writer_group_id,
            publishing_interval_ms,
            keep_alive_time_ms,
            priority,
            encoding: MessageEncoding::Uadp,
            max_encapsulated_dataset_message_count: 0,
            message_settings,
            transport_settings,
            security_mode,
            security_group_id,
            security_policy: None,
            custom_state_machine: None,
        },
        writers,
    })
}

fn decode_dataset_writer(ctx: &mut DecodeCtx) -> crate::Result<LoadedWriter> {
    let name = encoding::read_string(ctx)?;
    let enabled = ctx.read_u8()? != 0;
    let dataset_writer_id = ctx.read_u16()?;
    let field_content_mask = ctx.read_u32()?;
    let key_frame_count = ctx.read_u32()?;
    let dataset_name = encoding::read_string(ctx)?;
    read_key_value_pairs(ctx)?; // dataSetWriterProperties
    read_any_extension(ctx)?; // transportSettings

    let mut message_settings = UadpDataSetWriterMessageSettings::default();
    if let Some(body) = read_extension_body(ctx, ID_UADP_DATASET_WRITER_MESSAGE)? {
        let mut ms = DecodeCtx::new(&body);
        message_settings.dataset_message_content_mask = ms.read_u32()?;
        message_settings.configured_size = ms.read_u16()?;
        message_settings.network_message_number = ms.read_u16()?;
        message_settings.dataset_offset = ms.read_u16()?;
    }

    Ok(LoadedWriter {
        enabled,
        dataset_name: dataset_name.clone(),
        cfg: DataSetWriterConfig {
            name,
            dataset_writer_id,
            field_content_mask,
            key_frame_count,
            dataset_name,
            message_settings,
            custom_state_machine: None,
        },
    })
}

fn decode_reader_group(ctx: &mut DecodeCtx) -> crate::Result<LoadedReaderGroup> {
    let name = encoding::read_string(ctx)?;
    let enabled = ctx.read_u8()? != 0;
    let security_mode = SecurityMode::from_wire(ctx.read_i32()?);
    let security_group_id = encoding::read_string(ctx)?;
    let sks_len = read_array_len(ctx)?;
    if sks_len != 0 {
        return Err(StatusCode::BAD_NOT_SUPPORTED);
    }
    let _max_nm_size = ctx.read_u32()?;
    read_key_value_pairs(ctx)?;

    let (ts_id, ts_body) = read_any_extension(ctx)?;
    let transport_settings = match ts_body {
        Some(body) if ts_id == NodeId::ns0(ID_BROKER_READER_GROUP_TRANSPORT) => {
            let mut ts = DecodeCtx::new(&body);
            let queue_name = encoding::read_string(&mut ts)?;
            ReaderGroupTransportSettings::Broker { queue_name }
        }
        _ => ReaderGroupTransportSettings::None,
    };
    read_any_extension(ctx)?; // messageSettings

    let readers_len = read_array_len(ctx)?;
    let mut readers = Vec::with_capacity(readers_len);
    for _ in 0..readers_len {
        readers.push(decode_dataset_reader(ctx)?);
    }

    Ok(LoadedReaderGroup {
        enabled,
        cfg: ReaderGroupConfig {
            name,
            encoding: MessageEncoding::Uadp,
            transport_settings,
            security_mode,
            security_group_id,
            security_policy: None,
            custom_state_machine: None,
        },
        readers,
    })
}

fn decode_dataset_reader(ctx: &mut DecodeCtx) -> crate::Result<LoadedReader> {
    let name = encoding::read_string(ctx)?;
    let enabled = ctx.read_u8()? != 0;
    let publisher_id = publisher_id_from_variant(&encoding::read_variant(ctx)?)?;
    let writer_group_id = ctx.read_u16()?;
    let dataset_writer_id = ctx.read_u16()?;
    let dataset_metadata = decode_metadata(ctx)?;
    let _field_content_mask = ctx.read_u32()?;
    let message_receive_timeout_ms = ctx.read_f64()?;
    let _key_frame_count = ctx.read_u32()?;
    encoding::read_string(ctx)?; // headerLayoutUri
    let _security_mode = ctx.read_i32()?;
    encoding::read_string(ctx)?; // securityGroupId
    let sks_len = read_array_len(ctx)?;
    if sks_len != 0 {
        return Err(StatusCode::BAD_NOT_SUPPORTED);
    }
    read_any_extension(ctx)?; // transportSettings
    read_any_extension(ctx)?; // messageSettings

    let mut target_variables = Vec::new();
    if let Some(body) = read_extension_body(ctx, ID_TARGET_VARIABLES)? {
        let mut sds = DecodeCtx::new(&body);
        let count = read_array_len(&mut sds)?;
        for _ in 0..count {
            let dataset_field_id = encoding::read_guid(&mut sds)?;
            let receiver_index_range = encoding::read_string(&mut sds)?;
            let target_node_id = encoding::read_node_id(&mut sds)?;
            let attribute_id = AttributeId::from_u32(sds.read_u32()?)
                .ok_or(StatusCode::BAD_ATTRIBUTE_ID_INVALID)?;
            encoding::read_string(&mut sds)?; // writeIndexRange
            let _override_handling = sds.read_i32()?;
            let _override_value = encoding::read_variant(&mut sds)?;
            target_variables.push(FieldTarget {
                dataset_field_id,
                receiver_index_range,
                target_node_id,
                attribute_id,
            });
        }
    }

    Ok(LoadedReader {
        enabled,
        cfg: DataSetReaderConfig {
            name,
            publisher_id,
            writer_group_id,
            dataset_writer_id,
            dataset_metadata,
            message_receive_timeout_ms,
            target_variables,
            custom_state_machine: None,
        },
    })
}

fn decode_connection(ctx: &mut DecodeCtx) -> crate::Result<LoadedConnection> {
    let name = encoding::read_string(ctx)?;
    let enabled = ctx.read_u8()? != 0;
    let publisher_id = publisher_id_from_variant(&encoding::read_variant(ctx)?)?;
    let transport_profile_uri = encoding::read_string(ctx)?;

    let body =
        read_extension_body(ctx, ID_NETWORK_ADDRESS_URL)?.ok_or(StatusCode::BAD_TYPE_MISMATCH)?;
    let mut addr = DecodeCtx::new(&body);
    let network_interface = encoding::read_string(&mut addr)?;
    let url = encoding::read_string(&mut addr)?;

    let connection_properties = read_key_value_pairs(ctx)?;
    read_any_extension(ctx)?; // transportSettings

    let wg_len = read_array_len(ctx)?;
    let mut writer_groups = Vec::with_capacity(wg_len);
    for _ in 0..wg_len {
        writer_groups.push(decode_writer_group(ctx)?);
    }
    let rg_len = read_array_len(ctx)?;
    let mut reader_groups = Vec::with_capacity(rg_len);
    for _ in 0..rg_len {
        reader_groups.push(decode_reader_group(ctx)?);
    }

    Ok(LoadedConnection {
        enabled,
        cfg: PubSubConnectionConfig {
            name,
            publisher_id: Some(publisher_id),
            transport_profile_uri,
            address: NetworkAddressUrl { network_interface, url },
            connection_properties,
            custom_state_machine: None,
        },
        writer_groups,
        reader_groups,
    })
}

fn decode_config(bytes: &[u8]) -> crate::Result<LoadedConfig> {
    let mut ctx = DecodeCtx::new(bytes);

    // Outer ExtensionObject: UABinaryFileDataType
    let file_body =
        read_extension_body(&mut ctx, ID_UABINARYFILE)?.ok_or(StatusCode::BAD_TYPE_MISMATCH)?;
    let mut file = DecodeCtx::new(&file_body);
    skip_string_array(&mut file)?; // namespaces
    for _ in 0..3 {
        let len = read_array_len(&mut file)?;
        if len != 0 {
            return Err(StatusCode::BAD_NOT_SUPPORTED);
        }
    }
    encoding::read_string(&mut file)?; // schemaLocation
    read_key_value_pairs(&mut file)?; // fileHeader

    // body: Variant containing the configuration ExtensionObject
    let body_variant = encoding::read_variant(&mut file)?;
    let Variant::ExtensionObject(eo) = body_variant else {
        return Err(StatusCode::BAD_TYPE_MISMATCH);
    };
    if eo.type_id != NodeId::ns0(ID_PUBSUB_CONFIGURATION) {
        return Err(StatusCode::BAD_TYPE_MISMATCH);
    }
    let ExtensionObjectBody::ByteString(cfg_bytes) = eo.body else {
        return Err(StatusCode::BAD_TYPE_MISMATCH);
    };

    let mut cfg = DecodeCtx::new(&cfg_bytes);
    let ds_len = read_array_len(&mut cfg)?;
    let mut datasets = Vec::with_capacity(ds_len);
    for _ in 0..ds_len {
        datasets.push(decode_published_dataset(&mut cfg)?);
    }
    let conn_len = read_array_len(&mut cfg)?;
    let mut connections = Vec::with_capacity(conn_len);
    for _ in 0..conn_len {
        connections.push(decode_connection(&mut cfg)?);
    }
    let enabled = cfg.read_u8()? != 0;

    Ok(LoadedConfig { datasets, connections, enabled })
}

// ============================================================================
// Manager API
// ============================================================================

impl PubSubManager {
    /// Re-encode the live manager state as a configuration file buffer.
    pub fn save_config(&self) -> crate::Result<Vec<u8>> {
        let psm = self.psm.lock();

        let mut cfg = Out::new();
        cfg.i32(psm.published_datasets.len() as i32);
        for pds in psm.published_datasets.values() {
            encode_published_dataset(&mut cfg, pds)?;
        }
        cfg.i32(psm.connections.len() as i32);
        for c in psm.connections.values() {
            encode_connection(&psm, &mut cfg, c)?;
        }
        cfg.boolean(psm.lifecycle == PubSubLifecycleState::Started);

        let config_eo = ExtensionObject::binary(NodeId::ns0(ID_PUBSUB_CONFIGURATION), cfg.buf);

        let mut file = Out::new();
        file.string_array(&[])?; // namespaces
        file.i32(0); // structureDataTypes
        file.i32(0); // enumDataTypes
        file.i32(0); // simpleDataTypes
        file.string("")?; // schemaLocation
        file.key_value_pairs(&[])?; // fileHeader
        file.variant(&Variant::ExtensionObject(Box::new(config_eo)))?;

        let mut out = Out::new();
        out.extension_object(ID_UABINARYFILE, Some(file.buf))?;
        Ok(out.buf)
    }

    /// Replace the entire manager state with a saved configuration.
    pub fn load_config(&self, bytes: &[u8]) -> crate::Result<()> {
        let loaded = decode_config(bytes)?;

        // Wipe the current state.
        {
            let conns: Vec<NodeId> = {
                let psm = self.psm.lock();
                psm.connections
                    .values()
                    .map(|c| c.head.node_id.clone())
                    .collect()
            };
            for c in conns {
                let _ = self.remove_connection(&c);
            }
            let datasets: Vec<NodeId> = {
                let psm = self.psm.lock();
                psm.published_datasets
                    .values()
                    .map(|p| p.head.node_id.clone())
                    .collect()
            };
            for p in datasets {
                let _ = self.remove_published_dataset(&p);
            }
            let sds: Vec<NodeId> = {
                let psm = self.psm.lock();
                psm.subscribed_datasets
                    .values()
                    .map(|s| s.head.node_id.clone())
                    .collect()
            };
            for s in sds {
                let _ = self.remove_subscribed_dataset(&s);
            }
        }

        // Recreate the tree.
        for ds in &loaded.datasets {
            let pds = self.add_published_dataset(&ds.cfg)?;
            for field in &ds.fields {
                self.add_dataset_field(&pds, &field.cfg)?;
            }
        }

        for conn in &loaded.connections {
            let conn_id = self.add_connection(&conn.cfg)?;
            for wg in &conn.writer_groups {
                let wg_id = self.add_writer_group(&conn_id, &wg.cfg)?;
                for dsw in &wg.writers {
                    let pds_id = self
                        .find_published_dataset(&dsw.dataset_name)
                        .unwrap_or(NodeId::NULL);
                    let writer = self.add_dataset_writer(&wg_id, &pds_id, &dsw.cfg)?;
                    if dsw.enabled {
                        self.enable_dataset_writer(&writer)?;
                    }
                }
                if wg.enabled {
                    let _ = self.enable_writer_group(&wg_id);
                }
            }
            for rg in &conn.reader_groups {
                let rg_id = self.add_reader_group(&conn_id, &rg.cfg)?;
                for dsr in &rg.readers {
                    let reader = self.add_dataset_reader(&rg_id, &dsr.cfg)?;
                    if dsr.enabled {
                        self.enable_dataset_reader(&reader)?;
                    }
                }
                if rg.enabled {
                    let _ = self.enable_reader_group(&rg_id);
                }
            }
            if conn.enabled {
                let _ = self.enable_connection(&conn_id);
            }
        }

        if loaded.enabled {
            self.start();
        }
        Ok(())
    }
}
