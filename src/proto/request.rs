use super::Watch;
use super::ZkError;
use crate::CreateMode;
use byteorder::{BigEndian, WriteBytesExt};
use std::io::{self, Write};

#[derive(Debug)]
pub(crate) enum Request {
    Connect {
        protocol_version: i32,
        last_zxid_seen: i64,
        timeout: i32,
        session_id: i64,
        passwd: Vec<u8>,
        read_only: bool,
    },
    Exists {
        path: String,
        watch: Watch,
    },
    Delete {
        path: String,
        version: i32,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    GetChildren {
        path: String,
        watch: Watch,
    },
    GetData {
        path: String,
        watch: Watch,
    },
    Check {
        path: String,
        version: i32,
    },
    Multi(Vec<Request>),
    SetWatches {
        relative_zxid: i64,
        data: Vec<String>,
        exist: Vec<String>,
        child: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(i32)]
pub(crate) enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    Exists = 3,
    GetData = 4,
    SetData = 5,
    GetChildren = 8,
    Ping = 11,
    Check = 13,
    Multi = 14,
    SetWatches = 101,
    CreateSession = -10,
    CloseSession = -11,
    Error = -1,
}

impl TryFrom<i32> for OpCode {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, i32> {
        match code {
            0 => Ok(OpCode::Notification),
            1 => Ok(OpCode::Create),
            2 => Ok(OpCode::Delete),
            3 => Ok(OpCode::Exists),
            4 => Ok(OpCode::GetData),
            5 => Ok(OpCode::SetData),
            8 => Ok(OpCode::GetChildren),
            11 => Ok(OpCode::Ping),
            13 => Ok(OpCode::Check),
            14 => Ok(OpCode::Multi),
            101 => Ok(OpCode::SetWatches),
            -10 => Ok(OpCode::CreateSession),
            -11 => Ok(OpCode::CloseSession),
            -1 => Ok(OpCode::Error),
            _ => Err(code),
        }
    }
}

/// Header preceding every operation (and every result) inside a `multi` body.
pub(crate) enum MultiHeader {
    NextOk(OpCode),
    NextErr(ZkError),
    Done,
}

pub(crate) trait WriteTo {
    fn write_to<W: Write>(&self, writer: W) -> io::Result<()>;
}

impl WriteTo for MultiHeader {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let (opcode, done, err) = match *self {
            MultiHeader::NextOk(opcode) => (opcode as i32, false, -1),
            MultiHeader::NextErr(err) => (OpCode::Error as i32, false, err as i32),
            MultiHeader::Done => (OpCode::Error as i32, true, -1),
        };
        writer.write_i32::<BigEndian>(opcode)?;
        writer.write_u8(done as u8)?;
        writer.write_i32::<BigEndian>(err)
    }
}

impl WriteTo for u8 {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(*self)?;
        Ok(())
    }
}

impl WriteTo for str {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.len() as i32)?;
        writer.write_all(self.as_ref())
    }
}

impl WriteTo for String {
    fn write_to<W: Write>(&self, writer: W) -> io::Result<()> {
        self.as_str().write_to(writer)
    }
}

impl WriteTo for [u8] {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.len() as i32)?;
        writer.write_all(self.as_ref())
    }
}

pub(crate) fn write_list<W, T>(mut writer: W, ts: &[T]) -> io::Result<()>
where
    T: WriteTo,
    W: Write,
{
    writer.write_i32::<BigEndian>(ts.len() as i32)?;
    for elem in ts {
        elem.write_to(&mut writer)?;
    }
    Ok(())
}

/// Every node is created with the `world:anyone` ACL granting all permissions.
fn write_open_acl<W: Write>(mut writer: W) -> io::Result<()> {
    const PERMS_ALL: i32 = 0b11111;
    writer.write_i32::<BigEndian>(1)?;
    writer.write_i32::<BigEndian>(PERMS_ALL)?;
    "world".write_to(&mut writer)?;
    "anyone".write_to(writer)
}

impl Request {
    pub(crate) fn serialize_into(&self, buffer: &mut Vec<u8>) -> Result<(), io::Error> {
        match *self {
            Request::Connect {
                protocol_version,
                last_zxid_seen,
                timeout,
                session_id,
                ref passwd,
                read_only,
            } => {
                buffer.write_i32::<BigEndian>(protocol_version)?;
                buffer.write_i64::<BigEndian>(last_zxid_seen)?;
                buffer.write_i32::<BigEndian>(timeout)?;
                buffer.write_i64::<BigEndian>(session_id)?;
                passwd[..].write_to(&mut *buffer)?;
                buffer.write_u8(read_only as u8)?;
            }
            Request::GetData {
                ref path,
                ref watch,
            }
            | Request::GetChildren {
                ref path,
                ref watch,
            }
            | Request::Exists {
                ref path,
                ref watch,
            } => {
                path.write_to(&mut *buffer)?;
                buffer.write_u8(watch.to_u8())?;
            }
            Request::Delete { ref path, version } | Request::Check { ref path, version } => {
                path.write_to(&mut *buffer)?;
                buffer.write_i32::<BigEndian>(version)?;
            }
            Request::SetData {
                ref path,
                ref data,
                version,
            } => {
                path.write_to(&mut *buffer)?;
                data[..].write_to(&mut *buffer)?;
                buffer.write_i32::<BigEndian>(version)?;
            }
            Request::Create {
                ref path,
                ref data,
                mode,
            } => {
                path.write_to(&mut *buffer)?;
                data[..].write_to(&mut *buffer)?;
                write_open_acl(&mut *buffer)?;
                buffer.write_i32::<BigEndian>(mode as i32)?;
            }
            Request::Multi(ref requests) => {
                for r in requests {
                    MultiHeader::NextOk(r.opcode()).write_to(&mut *buffer)?;
                    r.serialize_into(&mut *buffer)?;
                }
                MultiHeader::Done.write_to(&mut *buffer)?;
            }
            Request::SetWatches {
                relative_zxid,
                ref data,
                ref exist,
                ref child,
            } => {
                buffer.write_i64::<BigEndian>(relative_zxid)?;
                write_list(&mut *buffer, data)?;
                write_list(&mut *buffer, exist)?;
                write_list(&mut *buffer, child)?;
            }
        }
        Ok(())
    }

    pub(crate) fn opcode(&self) -> OpCode {
        match *self {
            Request::Connect { .. } => OpCode::CreateSession,
            Request::Exists { .. } => OpCode::Exists,
            Request::Delete { .. } => OpCode::Delete,
            Request::Create { .. } => OpCode::Create,
            Request::GetChildren { .. } => OpCode::GetChildren,
            Request::SetData { .. } => OpCode::SetData,
            Request::GetData { .. } => OpCode::GetData,
            Request::Multi { .. } => OpCode::Multi,
            Request::Check { .. } => OpCode::Check,
            Request::SetWatches { .. } => OpCode::SetWatches,
        }
    }
}
