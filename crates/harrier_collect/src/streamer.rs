//! Type-directed wire encoders for a phase's output columns.
//!
//! One `Streamer` per output type. Values are encoded little-endian with a
//! null-flag byte; variable-length values carry a u32 length prefix. The
//! page bucket receiver stores these opaquely for the transport layer.

use bytes::{BufMut, BytesMut};

use harrier_common::datum::Datum;
use harrier_common::error::{HarrierResult, ProtocolError};
use harrier_common::types::DataType;

#[derive(Debug, Clone)]
pub struct Streamer {
    data_type: DataType,
}

/// Build the streamer array for a phase's output types.
pub fn streamers_for(types: &[DataType]) -> Vec<Streamer> {
    types.iter().cloned().map(Streamer::new).collect()
}

impl Streamer {
    pub fn new(data_type: DataType) -> Self {
        Self { data_type }
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn write_datum(&self, out: &mut BytesMut, datum: &Datum) -> HarrierResult<()> {
        if datum.is_null() {
            out.put_u8(0);
            return Ok(());
        }
        out.put_u8(1);
        match (&self.data_type, datum) {
            (DataType::Boolean, Datum::Boolean(b)) => out.put_u8(u8::from(*b)),
            (DataType::Int32, Datum::Int32(v)) => out.put_i32_le(*v),
            (DataType::Int64, Datum::Int64(v)) => out.put_i64_le(*v),
            (DataType::Float64, Datum::Float64(v)) => out.put_f64_le(*v),
            (DataType::Timestamp, Datum::Timestamp(us)) => out.put_i64_le(*us),
            (DataType::Text, Datum::Text(s)) => {
                out.put_u32_le(s.len() as u32);
                out.put_slice(s.as_bytes());
            }
            (DataType::Bytea, Datum::Bytea(b)) => {
                out.put_u32_le(b.len() as u32);
                out.put_slice(b);
            }
            (expected, got) => {
                return Err(ProtocolError::TypeMismatch {
                    expected: expected.to_string(),
                    got: got
                        .data_type()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "null".into()),
                }
                .into())
            }
        }
        Ok(())
    }

    pub fn read_datum(&self, buf: &mut &[u8]) -> HarrierResult<Datum> {
        if read_u8(buf)? == 0 {
            return Ok(Datum::Null);
        }
        let datum = match self.data_type {
            DataType::Boolean => Datum::Boolean(read_u8(buf)? != 0),
            DataType::Int32 => Datum::Int32(i32::from_le_bytes(read_fixed::<4>(buf)?)),
            DataType::Int64 => Datum::Int64(i64::from_le_bytes(read_fixed::<8>(buf)?)),
            DataType::Float64 => Datum::Float64(f64::from_le_bytes(read_fixed::<8>(buf)?)),
            DataType::Timestamp => Datum::Timestamp(i64::from_le_bytes(read_fixed::<8>(buf)?)),
            DataType::Text => {
                let len = u32::from_le_bytes(read_fixed::<4>(buf)?) as usize;
                let bytes = read_bytes(buf, len)?;
                Datum::Text(String::from_utf8(bytes).map_err(|_| ProtocolError::TypeMismatch {
                    expected: "utf-8 text".into(),
                    got: "invalid utf-8".into(),
                })?)
            }
            DataType::Bytea => {
                let len = u32::from_le_bytes(read_fixed::<4>(buf)?) as usize;
                Datum::Bytea(read_bytes(buf, len)?)
            }
        };
        Ok(datum)
    }
}

fn ensure(buf: &[u8], need: usize) -> HarrierResult<()> {
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            expected: need,
            actual: buf.len(),
        }
        .into());
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8]) -> HarrierResult<u8> {
    ensure(buf, 1)?;
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

fn read_fixed<const N: usize>(buf: &mut &[u8]) -> HarrierResult<[u8; N]> {
    ensure(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(arr)
}

fn read_bytes(buf: &mut &[u8], n: usize) -> HarrierResult<Vec<u8>> {
    ensure(buf, n)?;
    let v = buf[..n].to_vec();
    *buf = &buf[n..];
    Ok(v)
}
