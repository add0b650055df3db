//! The bytecode container: a single contiguous byte buffer holding the
//! static-object table and the code section.
//!
//! Layout, all multi-byte integers little-endian:
//!
//! 1. 4-byte magic `A C E 0x01`.
//! 2. 1-byte version major, 1-byte version minor.
//! 3. 4-byte static-table length (entry count).
//! 4. Static table entries: 1-byte tag, then payload.
//! 5. 4-byte code length, then the code section.
//!
//! Code-section addresses target `program start + label position`.

use std::fmt;

use crate::emit::static_object::{FunctionFlags, StaticFunction, StaticObject, StaticTypeInfo};

pub const MAGIC: [u8; 4] = [b'A', b'C', b'E', 0x01];
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

const TAG_LABEL: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_FUNCTION: u8 = 3;
const TAG_TYPE_INFO: u8 = 4;

/// A decoded program: the static table plus the flat code section.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statics: Vec<StaticObject>,
    pub code: Vec<u8>,
}

/// Container decode failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    BadMagic,
    UnsupportedVersion { major: u8, minor: u8 },
    Truncated,
    BadTag(u8),
    BadString,
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not an ace bytecode container"),
            Self::UnsupportedVersion { major, minor } => {
                write!(f, "unsupported container version {major}.{minor}")
            }
            Self::Truncated => write!(f, "container is truncated"),
            Self::BadTag(tag) => write!(f, "unknown static-object tag {tag}"),
            Self::BadString => write!(f, "static string is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ContainerError {}

/// Encodes the static table and code section into a container buffer.
#[must_use]
pub fn encode(statics: &[StaticObject], code: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(code.len() + 64);
    out.extend_from_slice(&MAGIC);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    out.extend_from_slice(&u32::try_from(statics.len()).expect("static table fits u32").to_le_bytes());
    for entry in statics {
        match entry {
            StaticObject::Label { position } => {
                out.push(TAG_LABEL);
                out.extend_from_slice(&position.to_le_bytes());
            }
            StaticObject::String(s) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&u32::try_from(s.len()).expect("string fits u32").to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            StaticObject::Function(f) => {
                out.push(TAG_FUNCTION);
                out.extend_from_slice(&f.addr.to_le_bytes());
                out.push(f.nargs);
                out.push(f.flags.bits());
            }
            StaticObject::TypeInfo(info) => {
                out.push(TAG_TYPE_INFO);
                out.push(u8::try_from(info.members.len()).expect("member count fits u8"));
                push_name(&mut out, &info.name);
                for member in &info.members {
                    push_name(&mut out, member);
                }
            }
        }
    }
    out.extend_from_slice(&u32::try_from(code.len()).expect("code fits u32").to_le_bytes());
    out.extend_from_slice(code);
    out
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&u16::try_from(name.len()).expect("name fits u16").to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

/// Decodes a container buffer.
pub fn decode(bytes: &[u8]) -> Result<Program, ContainerError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    if cursor.take(4)? != MAGIC {
        return Err(ContainerError::BadMagic);
    }
    let major = cursor.u8()?;
    let minor = cursor.u8()?;
    if major != VERSION_MAJOR {
        return Err(ContainerError::UnsupportedVersion { major, minor });
    }
    let entry_count = cursor.u32()? as usize;
    let mut statics = Vec::with_capacity(entry_count.min(4096));
    for _ in 0..entry_count {
        let tag = cursor.u8()?;
        let entry = match tag {
            TAG_LABEL => StaticObject::Label { position: cursor.u32()? },
            TAG_STRING => {
                let len = cursor.u32()? as usize;
                let raw = cursor.take(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| ContainerError::BadString)?;
                StaticObject::String(s.into())
            }
            TAG_FUNCTION => {
                let addr = cursor.u32()?;
                let nargs = cursor.u8()?;
                let flags = FunctionFlags::from_bits_truncate(cursor.u8()?);
                StaticObject::Function(StaticFunction { addr, nargs, flags })
            }
            TAG_TYPE_INFO => {
                let member_count = cursor.u8()? as usize;
                let name = cursor.name()?;
                let mut members = Vec::with_capacity(member_count);
                for _ in 0..member_count {
                    members.push(cursor.name()?);
                }
                StaticObject::TypeInfo(StaticTypeInfo { name, members })
            }
            other => return Err(ContainerError::BadTag(other)),
        };
        statics.push(entry);
    }
    let code_len = cursor.u32()? as usize;
    let code = cursor.take(code_len)?.to_vec();
    Ok(Program { statics, code })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ContainerError> {
        let end = self.pos.checked_add(n).ok_or(ContainerError::Truncated)?;
        if end > self.bytes.len() {
            return Err(ContainerError::Truncated);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ContainerError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ContainerError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, ContainerError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn name(&mut self) -> Result<Box<str>, ContainerError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(Into::into)
            .map_err(|_| ContainerError::BadString)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let statics = vec![
            StaticObject::Label { position: 42 },
            StaticObject::String("hello".into()),
            StaticObject::Function(StaticFunction {
                addr: 0x10,
                nargs: 2,
                flags: FunctionFlags::VARIADIC,
            }),
            StaticObject::TypeInfo(StaticTypeInfo {
                name: "Point".into(),
                members: vec!["x".into(), "y".into(), "$proto".into()],
            }),
        ];
        let code = vec![0x00, 0xFF];
        let encoded = encode(&statics, &code);
        assert_eq!(&encoded[..4], &MAGIC);
        let program = decode(&encoded).expect("round trip");
        assert_eq!(program.statics, statics);
        assert_eq!(program.code, code);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = decode(b"NOPE\x01\x00").expect_err("bad magic");
        assert_eq!(err, ContainerError::BadMagic);
    }

    #[test]
    fn rejects_truncated_input() {
        let encoded = encode(&[StaticObject::String("abc".into())], &[0x00]);
        let err = decode(&encoded[..encoded.len() - 3]).expect_err("truncated");
        assert_eq!(err, ContainerError::Truncated);
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut encoded = encode(&[StaticObject::Label { position: 0 }], &[]);
        // Corrupt the first entry tag.
        encoded[10] = 9;
        let err = decode(&encoded).expect_err("bad tag");
        assert_eq!(err, ContainerError::BadTag(9));
    }
}
