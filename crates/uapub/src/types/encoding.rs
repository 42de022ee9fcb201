// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OPC UA binary encoding (Part 6 Section 5.2).
//!
//! All multi-byte integers are little-endian; strings and byte strings carry
//! a 4-byte signed length prefix (-1 = null). The encoder writes in place
//! into a caller-provided buffer so the two-pass NetworkMessage encoder can
//! size first and fill second.

use super::{
    BuiltInType, DataValue, DateTime, ExtensionObject, ExtensionObjectBody, Guid, Identifier,
    LocalizedText, NodeId, QualifiedName, StatusCode, Variant,
};

pub type Result<T> = std::result::Result<T, StatusCode>;

// ============================================================================
// Cursors
// ============================================================================

/// In-place encoding cursor over a preallocated buffer.
pub struct EncodeCtx<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> EncodeCtx<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        EncodeCtx { buf, pos: 0 }
    }

    #[must_use]
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[must_use]
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.remaining() < bytes.len() {
            return Err(StatusCode::BAD_ENCODING_LIMITS_EXCEEDED);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    #[inline]
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    #[inline]
    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }
}

/// Decoding cursor. `end` can be pulled in to strip a signature tail.
pub struct DecodeCtx<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> DecodeCtx<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        DecodeCtx { buf, pos: 0, end: buf.len() }
    }

    #[must_use]
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[must_use]
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    #[must_use]
    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.end
    }

    /// Remove `n` bytes from the logical end (signature stripping).
    pub fn shrink_end(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
        self.end -= n;
        Ok(())
    }

    /// Skip `n` bytes (raw-field padding).
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
        self.pos += n;
        Ok(())
    }

    #[inline]
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(StatusCode::BAD_DECODING_ERROR);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_u32()?.to_le_bytes()))
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_u64()?.to_le_bytes()))
    }
}

// ============================================================================
// Strings & byte strings
// ============================================================================

pub fn write_string(ctx: &mut EncodeCtx, s: &str) -> Result<()> {
    if s.is_empty() {
        return ctx.write_i32(-1);
    }
    ctx.write_i32(s.len() as i32)?;
    ctx.write_bytes(s.as_bytes())
}

pub fn string_size(s: &str) -> usize {
    if s.is_empty() { 4 } else { 4 + s.len() }
}

pub fn read_string(ctx: &mut DecodeCtx) -> Result<String> {
    let len = ctx.read_i32()?;
    if len <= 0 {
        return Ok(String::new());
    }
    let bytes = ctx.read_bytes(len as usize)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| StatusCode::BAD_DECODING_ERROR)
}

pub fn write_byte_string(ctx: &mut EncodeCtx, b: &[u8]) -> Result<()> {
    if b.is_empty() {
        return ctx.write_i32(-1);
    }
    ctx.write_i32(b.len() as i32)?;
    ctx.write_bytes(b)
}

pub fn byte_string_size(b: &[u8]) -> usize {
    if b.is_empty() { 4 } else { 4 + b.len() }
}

pub fn read_byte_string(ctx: &mut DecodeCtx) -> Result<Vec<u8>> {
    let len = ctx.read_i32()?;
    if len <= 0 {
        return Ok(Vec::new());
    }
    Ok(ctx.read_bytes(len as usize)?.to_vec())
}

// ============================================================================
// Guid / NodeId / names
// ============================================================================

pub fn write_guid(ctx: &mut EncodeCtx, g: &Guid) -> Result<()> {
    ctx.write_u32(g.data1)?;
    ctx.write_u16(g.data2)?;
    ctx.write_u16(g.data3)?;
    ctx.write_bytes(&g.data4)
}

pub const GUID_SIZE: usize = 16;

pub fn read_guid(ctx: &mut DecodeCtx) -> Result<Guid> {
    let data1 = ctx.read_u32()?;
    let data2 = ctx.read_u16()?;
    let data3 = ctx.read_u16()?;
    let mut data4 = [0u8; 8];
    data4.copy_from_slice(ctx.read_bytes(8)?);
    Ok(Guid { data1, data2, data3, data4 })
}

pub fn write_node_id(ctx: &mut EncodeCtx, id: &NodeId) -> Result<()> {
    match &id.identifier {
        Identifier::Numeric(n) => {
            if id.namespace == 0 && *n <= u8::MAX as u32 {
                ctx.write_u8(0x00)?; // two-byte form
                ctx.write_u8(*n as u8)
            } else if id.namespace <= u8::MAX as u16 && *n <= u16::MAX as u32 {
                ctx.write_u8(0x01)?; // four-byte form
                ctx.write_u8(id.namespace as u8)?;
                ctx.write_u16(*n as u16)
            } else {
                ctx.write_u8(0x02)?;
                ctx.write_u16(id.namespace)?;
                ctx.write_u32(*n)
            }
        }
        Identifier::String(s) => {
            ctx.write_u8(0x03)?;
            ctx.write_u16(id.namespace)?;
            write_string(ctx, s)
        }
        Identifier::Guid(g) => {
            ctx.write_u8(0x04)?;
            ctx.write_u16(id.namespace)?;
            write_guid(ctx, g)
        }
        Identifier::ByteString(b) => {
            ctx.write_u8(0x05)?;
            ctx.write_u16(id.namespace)?;
            write_byte_string(ctx, b)
        }
    }
}

pub fn node_id_size(id: &NodeId) -> usize {
    match &id.identifier {
        Identifier::Numeric(n) => {
            if id.namespace == 0 && *n <= u8::MAX as u32 {
                2
            } else if id.namespace <= u8::MAX as u16 && *n <= u16::MAX as u32 {
                4
            } else {
                7
            }
        }
        Identifier::String(s) => 3 + string_size(s),
        Identifier::Guid(_) => 3 + GUID_SIZE,
        Identifier::ByteString(b) => 3 + byte_string_size(b),
    }
}

pub fn read_node_id(ctx: &mut DecodeCtx) -> Result<NodeId> {
    let enc = ctx.read_u8()?;
    match enc & 0x0F {
        0x00 => Ok(NodeId::numeric(0, ctx.read_u8()? as u32)),
        0x01 => {
            let ns = ctx.read_u8()? as u16;
            let id = ctx.read_u16()? as u32;
            Ok(NodeId::numeric(ns, id))
        }
        0x02 => {
            let ns = ctx.read_u16()?;
            let id = ctx.read_u32()?;
            Ok(NodeId::numeric(ns, id))
        }
        0x03 => {
            let ns = ctx.read_u16()?;
            let s = read_string(ctx)?;
            Ok(NodeId { namespace: ns, identifier: Identifier::String(s) })
        }
        0x04 => {
            let ns = ctx.read_u16()?;
            let g = read_guid(ctx)?;
            Ok(NodeId { namespace: ns, identifier: Identifier::Guid(g) })
        }
        0x05 => {
            let ns = ctx.read_u16()?;
            let b = read_byte_string(ctx)?;
            Ok(NodeId { namespace: ns, identifier: Identifier::ByteString(b) })
        }
        _ => Err(StatusCode::BAD_DECODING_ERROR),
    }
}

pub fn write_qualified_name(ctx: &mut EncodeCtx, qn: &QualifiedName) -> Result<()> {
    ctx.write_u16(qn.namespace)?;
    write_string(ctx, &qn.name)
}

pub fn qualified_name_size(qn: &QualifiedName) -> usize {
    2 + string_size(&qn.name)
}

pub fn read_qualified_name(ctx: &mut DecodeCtx) -> Result<QualifiedName> {
    let namespace = ctx.read_u16()?;
    let name = read_string(ctx)?;
    Ok(QualifiedName { namespace, name })
}

pub fn write_localized_text(ctx: &mut EncodeCtx, lt: &LocalizedText) -> Result<()> {
    let mut mask = 0u8;
    if !lt.locale.is_empty() {
        mask |= 0x01;
    }
    if !lt.text.is_empty() {
        mask |= 0x02;
    }
    ctx.write_u8(mask)?;
    if mask & 0x01 != 0 {
        write_string(ctx, &lt.locale)?;
    }
    if mask & 0x02 != 0 {
        write_string(ctx, &lt.text)?;
    }
    Ok(())
}

pub fn localized_text_size(lt: &LocalizedText) -> usize {
    let mut size = 1;
    if !lt.locale.is_empty() {
        size += string_size(&lt.locale);
    }
    if !lt.text.is_empty() {
        size += string_size(&lt.text);
    }
    size
}

pub fn read_localized_text(ctx: &mut DecodeCtx) -> Result<LocalizedText> {
    let mask = ctx.read_u8()?;
    let mut lt = LocalizedText::default();
    if mask & 0x01 != 0 {
        lt.locale = read_string(ctx)?;
    }
    if mask & 0x02 != 0 {
        lt.text = read_string(ctx)?;
    }
    Ok(lt)
}

// ============================================================================
// Scalar values without the Variant tag (shared with rawdata framing)
// ============================================================================

/// Encode a scalar variant body with no type tag. The caller has agreed on
/// the type out-of-band (Variant encoding byte or DataSet field metadata).
pub fn write_scalar(ctx: &mut EncodeCtx, v: &Variant) -> Result<()> {
    match v {
        Variant::Boolean(b) => ctx.write_u8(u8::from(*b)),
        Variant::SByte(x) => ctx.write_u8(*x as u8),
        Variant::Byte(x) => ctx.write_u8(*x),
        Variant::Int16(x) => ctx.write_i16(*x),
        Variant::UInt16(x) => ctx.write_u16(*x),
        Variant::Int32(x) => ctx.write_i32(*x),
        Variant::UInt32(x) => ctx.write_u32(*x),
        Variant::Int64(x) => ctx.write_i64(*x),
        Variant::UInt64(x) => ctx.write_u64(*x),
        Variant::Float(x) => ctx.write_f32(*x),
        Variant::Double(x) => ctx.write_f64(*x),
        Variant::String(s) => write_string(ctx, s),
        Variant::DateTime(dt) => ctx.write_i64(dt.0),
        Variant::Guid(g) => write_guid(ctx, g),
        Variant::ByteString(b) => write_byte_string(ctx, b),
        Variant::StatusCode(sc) => ctx.write_u32(sc.0),
        Variant::NodeId(id) => write_node_id(ctx, id),
        Variant::QualifiedName(qn) => write_qualified_name(ctx, qn),
        Variant::LocalizedText(lt) => write_localized_text(ctx, lt),
        Variant::ExtensionObject(eo) => write_extension_object(ctx, eo),
        Variant::Empty | Variant::Array { .. } => Err(StatusCode::BAD_ENCODING_ERROR),
    }
}

pub fn scalar_size(v: &Variant) -> usize {
    match v {
        Variant::Boolean(_) | Variant::SByte(_) | Variant::Byte(_) => 1,
        Variant::Int16(_) | Variant::UInt16(_) => 2,
        Variant::Int32(_) | Variant::UInt32(_) | Variant::Float(_) | Variant::StatusCode(_) => 4,
        Variant::Int64(_) | Variant::UInt64(_) | Variant::Double(_) | Variant::DateTime(_) => 8,
        Variant::String(s) => string_size(s),
        Variant::Guid(_) => GUID_SIZE,
        Variant::ByteString(b) => byte_string_size(b),
        Variant::NodeId(id) => node_id_size(id),
        Variant::QualifiedName(qn) => qualified_name_size(qn),
        Variant::LocalizedText(lt) => localized_text_size(lt),
        Variant::ExtensionObject(eo) => extension_object_size(eo),
        Variant::Empty | Variant::Array { .. } => 0,
    }
}

/// Decode a scalar of a known built-in type (no Variant tag on the wire).
pub fn read_scalar(ctx: &mut DecodeCtx, ty: BuiltInType) -> Result<Variant> {
    Ok(match ty {
        BuiltInType::Boolean => Variant::Boolean(ctx.read_u8()? != 0),
        BuiltInType::SByte => Variant::SByte(ctx.read_u8()? as i8),
        BuiltInType::Byte => Variant::Byte(ctx.read_u8()?),
        BuiltInType::Int16 => Variant::Int16(ctx.read_i16()?),
        BuiltInType::UInt16 => Variant::UInt16(ctx.read_u16()?),
        BuiltInType::Int32 => Variant::Int32(ctx.read_i32()?),
        BuiltInType::UInt32 => Variant::UInt32(ctx.read_u32()?),
        BuiltInType::Int64 => Variant::Int64(ctx.read_i64()?),
        BuiltInType::UInt64 => Variant::UInt64(ctx.read_u64()?),
        BuiltInType::Float => Variant::Float(ctx.read_f32()?),
        BuiltInType::Double => Variant::Double(ctx.read_f64()?),
        BuiltInType::String => Variant::String(read_string(ctx)?),
        BuiltInType::DateTime => Variant::DateTime(DateTime(ctx.read_i64()?)),
        BuiltInType::Guid => Variant::Guid(read_guid(ctx)?),
        BuiltInType::ByteString => Variant::ByteString(read_byte_string(ctx)?),
        BuiltInType::StatusCode => Variant::StatusCode(StatusCode(ctx.read_u32()?)),
        BuiltInType::NodeId => Variant::NodeId(read_node_id(ctx)?),
        BuiltInType::QualifiedName => Variant::QualifiedName(read_qualified_name(ctx)?),
        BuiltInType::LocalizedText => Variant::LocalizedText(read_localized_text(ctx)?),
        BuiltInType::ExtensionObject => {
            Variant::ExtensionObject(Box::new(read_extension_object(ctx)?))
        }
        BuiltInType::Variant => read_variant(ctx)?,
        BuiltInType::DataValue => {
            return Err(StatusCode::BAD_NOT_SUPPORTED);
        }
        _ => return Err(StatusCode::BAD_NOT_SUPPORTED),
    })
}

// ============================================================================
// Variant / DataValue / ExtensionObject
// ============================================================================

const VARIANT_ARRAY_FLAG: u8 = 0x80;
const VARIANT_DIMENSIONS_FLAG: u8 = 0x40;

pub fn write_variant(ctx: &mut EncodeCtx, v: &Variant) -> Result<()> {
    match v {
        Variant::Empty => ctx.write_u8(0),
        Variant::Array { elem, values, dimensions } => {
            let mut enc = (*elem as u8) | VARIANT_ARRAY_FLAG;
            if dimensions.is_some() {
                enc |= VARIANT_DIMENSIONS_FLAG;
            }
            ctx.write_u8(enc)?;
            ctx.write_i32(values.len() as i32)?;
            for item in values {
                write_scalar(ctx, item)?;
            }
            if let Some(dims) = dimensions {
                ctx.write_i32(dims.len() as i32)?;
                for d in dims {
                    ctx.write_u32(*d)?;
                }
            }
            Ok(())
        }
        scalar => {
            let ty = scalar.built_in_type().ok_or(StatusCode::BAD_ENCODING_ERROR)?;
            ctx.write_u8(ty as u8)?;
            write_scalar(ctx, scalar)
        }
    }
}

pub fn variant_size(v: &Variant) -> usize {
    match v {
        Variant::Empty => 1,
        Variant::Array { values, dimensions, .. } => {
            let mut size = 1 + 4;
            for item in values {
                size += scalar_size(item);
            }
            if let Some(dims) = dimensions {
                size += 4 + 4 * dims.len();
            }
            size
        }
        scalar => 1 + scalar_size(scalar),
    }
}

pub fn read_variant(ctx: &mut DecodeCtx) -> Result<Variant> {
    let enc = ctx.read_u8()?;
    if enc == 0 {
        return Ok(Variant::Empty);
    }
    let ty = BuiltInType::from_u8(enc & 0x3F).ok_or(StatusCode::BAD_DECODING_ERROR)?;
    if enc & VARIANT_ARRAY_FLAG == 0 {
        return read_scalar(ctx, ty);
    }
    let len = ctx.read_i32()?;
    let len = if len < 0 { 0 } else { len as usize };
    if len > ctx.remaining() {
        return Err(StatusCode::BAD_DECODING_ERROR);
    }
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(read_scalar(ctx, ty)?);
    }
    let dimensions = if enc & VARIANT_DIMENSIONS_FLAG != 0 {
        let ndims = ctx.read_i32()?;
        let ndims = if ndims < 0 { 0 } else { ndims as usize };
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(ctx.read_u32()?);
        }
        Some(dims)
    } else {
        None
    };
    Ok(Variant::Array { elem: ty, values, dimensions })
}

pub fn write_data_value(ctx: &mut EncodeCtx, dv: &DataValue) -> Result<()> {
    let mut mask = 0u8;
    if dv.value.is_some() {
        mask |= 0x01;
    }
    if dv.status.is_some() {
        mask |= 0x02;
    }
    if dv.source_timestamp.is_some() {
        mask |= 0x04;
    }
    if dv.server_timestamp.is_some() {
        mask |= 0x08;
    }
    if dv.source_picoseconds.is_some() {
        mask |= 0x10;
    }
    if dv.server_picoseconds.is_some() {
        mask |= 0x20;
    }
    ctx.write_u8(mask)?;
    if let Some(v) = &dv.value {
        write_variant(ctx, v)?;
    }
    if let Some(s) = dv.status {
        ctx.write_u32(s.0)?;
    }
    if let Some(ts) = dv.source_timestamp {
        ctx.write_i64(ts.0)?;
    }
    if let Some(ts) = dv.server_timestamp {
        ctx.write_i64(ts.0)?;
    }
    if let Some(p) = dv.source_picoseconds {
        ctx.write_u16(p)?;
    }
    if let Some(p) = dv.server_picoseconds {
        ctx.write_u16(p)?;
    }
    Ok(())
}

pub fn data_value_size(dv: &DataValue) -> usize {
    let mut size = 1;
    if let Some(v) = &dv.value {
        size += variant_size(v);
    }
    if dv.status.is_some() {
        size += 4;
    }
    if dv.source_timestamp.is_some() {
        size += 8;
    }
    if dv.server_timestamp.is_some() {
        size += 8;
    }
    if dv.source_picoseconds.is_some() {
        size += 2;
    }
    if dv.server_picoseconds.is_some() {
        size += 2;
    }
    size
}

pub fn read_data_value(ctx: &mut DecodeCtx) -> Result<DataValue> {
    let mask = ctx.read_u8()?;
    let mut dv = DataValue::default();
    if mask & 0x01 != 0 {
        dv.value = Some(read_variant(ctx)?);
    }
    if mask & 0x02 != 0 {
        dv.status = Some(StatusCode(ctx.read_u32()?));
    }
    if mask & 0x04 != 0 {
        dv.source_timestamp = Some(DateTime(ctx.read_i64()?));
    }
    if mask & 0x08 != 0 {
        dv.server_timestamp = Some(DateTime(ctx.read_i64()?));
    }
    if mask & 0x10 != 0 {
        dv.source_picoseconds = Some(ctx.read_u16()?);
    }
    if mask & 0x20 != 0 {
        dv.server_picoseconds = Some(ctx.read_u16()?);
    }
    Ok(dv)
}

pub fn write_extension_object(ctx: &mut EncodeCtx, eo: &ExtensionObject) -> Result<()> {
    write_node_id(ctx, &eo.type_id)?;
    match &eo.body {
        ExtensionObjectBody::None => ctx.write_u8(0x00),
        ExtensionObjectBody::ByteString(b) => {
            ctx.write_u8(0x01)?;
            ctx.write_i32(b.len() as i32)?;
            ctx.write_bytes(b)
        }
    }
}

pub fn extension_object_size(eo: &ExtensionObject) -> usize {
    node_id_size(&eo.type_id)
        + match &eo.body {
            ExtensionObjectBody::None => 1,
            ExtensionObjectBody::ByteString(b) => 1 + 4 + b.len(),
        }
}

pub fn read_extension_object(ctx: &mut DecodeCtx) -> Result<ExtensionObject> {
    let type_id = read_node_id(ctx)?;
    let enc = ctx.read_u8()?;
    let body = match enc {
        0x00 => ExtensionObjectBody::None,
        0x01 => {
            let len = ctx.read_i32()?;
            let len = if len < 0 { 0 } else { len as usize };
            ExtensionObjectBody::ByteString(ctx.read_bytes(len)?.to_vec())
        }
        // XML bodies are not produced by PubSub peers
        _ => return Err(StatusCode::BAD_NOT_SUPPORTED),
    };
    Ok(ExtensionObject { type_id, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_variant(v: &Variant) -> Variant {
        let size = variant_size(v);
        let mut buf = vec![0u8; size];
        let mut ctx = EncodeCtx::new(&mut buf);
        write_variant(&mut ctx, v).expect("encode");
        assert_eq!(ctx.pos(), size, "size pass and write pass must agree");
        let mut dctx = DecodeCtx::new(&buf);
        read_variant(&mut dctx).expect("decode")
    }

    #[test]
    fn test_variant_scalars() {
        let cases = vec![
            Variant::Empty,
            Variant::Boolean(true),
            Variant::Byte(0xAB),
            Variant::Int16(-17),
            Variant::UInt32(0xDEAD_BEEF),
            Variant::Int64(i64::MIN),
            Variant::Double(3.5),
            Variant::String("hello".into()),
            Variant::DateTime(DateTime(123_456_789)),
            Variant::ByteString(vec![1, 2, 3]),
            Variant::StatusCode(StatusCode::BAD_TIMEOUT),
            Variant::NodeId(NodeId::numeric(4, 100_000)),
        ];
        for v in cases {
            assert_eq!(roundtrip_variant(&v), v);
        }
    }

    #[test]
    fn test_variant_array_with_dimensions() {
        let v = Variant::Array {
            elem: BuiltInType::UInt16,
            values: vec![Variant::UInt16(1), Variant::UInt16(2), Variant::UInt16(3), Variant::UInt16(4)],
            dimensions: Some(vec![2, 2]),
        };
        assert_eq!(roundtrip_variant(&v), v);
    }

    #[test]
    fn test_node_id_forms() {
        // two-byte, four-byte, full numeric, string
        for id in [
            NodeId::ns0(42),
            NodeId::numeric(3, 1000),
            NodeId::numeric(300, 1_000_000),
            NodeId::string(2, "pump/speed"),
        ] {
            let mut buf = vec![0u8; node_id_size(&id)];
            let mut ctx = EncodeCtx::new(&mut buf);
            write_node_id(&mut ctx, &id).expect("encode");
            assert_eq!(ctx.pos(), buf.len());
            let mut dctx = DecodeCtx::new(&buf);
            assert_eq!(read_node_id(&mut dctx).expect("decode"), id);
        }
    }

    #[test]
    fn test_data_value_mask() {
        let dv = DataValue {
            value: Some(Variant::Double(1.25)),
            status: Some(StatusCode::GOOD),
            source_timestamp: Some(DateTime(77)),
            server_timestamp: None,
            source_picoseconds: None,
            server_picoseconds: Some(12),
        };
        let mut buf = vec![0u8; data_value_size(&dv)];
        let mut ctx = EncodeCtx::new(&mut buf);
        write_data_value(&mut ctx, &dv).expect("encode");
        assert_eq!(ctx.pos(), buf.len());
        let mut dctx = DecodeCtx::new(&buf);
        assert_eq!(read_data_value(&mut dctx).expect("decode"), dv);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let v = Variant::String("truncate-me".into());
        let mut buf = vec![0u8; variant_size(&v)];
        let mut ctx = EncodeCtx::new(&mut buf);
        write_variant(&mut ctx, &v).expect("encode");
        let mut dctx = DecodeCtx::new(&buf[..buf.len() - 4]);
        assert!(read_variant(&mut dctx).is_err());
    }

    #[test]
    fn test_encode_overflow_is_rejected() {
        let mut buf = [0u8; 2];
        let mut ctx = EncodeCtx::new(&mut buf);
        assert!(write_string(&mut ctx, "too long").is_err());
    }
}
