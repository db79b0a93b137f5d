use super::request::OpCode;
use super::ZkError;
use crate::{KeeperState, Stat, WatchedEvent, WatchedEventType};
use byteorder::{BigEndian, ReadBytesExt};
use failure::{bail, format_err};
use std::io::{self, Read};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Response {
    Connect {
        protocol_version: i32,
        timeout: i32,
        session_id: i64,
        password: Vec<u8>,
        read_only: bool,
    },
    Stat(Stat),
    GetData {
        bytes: Vec<u8>,
        stat: Stat,
    },
    Strings(Vec<String>),
    String(String),
    Empty,
    Multi(Vec<Result<Response, ZkError>>),
}

pub(crate) trait ReadFrom: Sized {
    fn read_from<R: Read>(read: &mut R) -> io::Result<Self>;
}

impl ReadFrom for Stat {
    fn read_from<R: Read>(read: &mut R) -> io::Result<Stat> {
        Ok(Stat {
            czxid: read.read_i64::<BigEndian>()?,
            mzxid: read.read_i64::<BigEndian>()?,
            ctime: read.read_i64::<BigEndian>()?,
            mtime: read.read_i64::<BigEndian>()?,
            version: read.read_i32::<BigEndian>()?,
            cversion: read.read_i32::<BigEndian>()?,
            aversion: read.read_i32::<BigEndian>()?,
            ephemeral_owner: read.read_i64::<BigEndian>()?,
            data_length: read.read_i32::<BigEndian>()?,
            num_children: read.read_i32::<BigEndian>()?,
            pzxid: read.read_i64::<BigEndian>()?,
        })
    }
}

fn invalid(what: &str, code: i32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unknown {} {}", what, code),
    )
}

impl ReadFrom for WatchedEvent {
    fn read_from<R: Read>(read: &mut R) -> io::Result<WatchedEvent> {
        let wtype = read.read_i32::<BigEndian>()?;
        let state = read.read_i32::<BigEndian>()?;
        let path = read.read_string()?;
        Ok(WatchedEvent {
            event_type: WatchedEventType::try_from(wtype)
                .map_err(|c| invalid("event type", c))?,
            keeper_state: KeeperState::try_from(state).map_err(|c| invalid("keeper state", c))?,
            path,
        })
    }
}

pub(crate) trait BufferReader: Read {
    fn read_buffer(&mut self) -> io::Result<Vec<u8>>;
}

impl<R: Read> BufferReader for R {
    fn read_buffer(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_i32::<BigEndian>()?;
        // a length of -1 encodes a null buffer
        let len = if len < 0 { 0 } else { len as usize };
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

pub(crate) trait StringReader: Read {
    fn read_string(&mut self) -> io::Result<String>;
    fn read_string_list(&mut self) -> io::Result<Vec<String>>;
}

impl<R: Read> StringReader for R {
    fn read_string(&mut self) -> io::Result<String> {
        let raw = self.read_buffer()?;
        String::from_utf8(raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_string_list(&mut self) -> io::Result<Vec<String>> {
        let len = self.read_i32::<BigEndian>()?;
        let mut items = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            items.push(self.read_string()?);
        }
        Ok(items)
    }
}

impl Response {
    pub(super) fn parse(opcode: OpCode, reader: &mut &[u8]) -> Result<Self, failure::Error> {
        match opcode {
            OpCode::CreateSession => Ok(Response::Connect {
                protocol_version: reader.read_i32::<BigEndian>()?,
                timeout: reader.read_i32::<BigEndian>()?,
                session_id: reader.read_i64::<BigEndian>()?,
                password: reader.read_buffer()?,
                // servers predating read-only mode omit the trailing flag
                read_only: reader.read_u8().map(|b| b != 0).unwrap_or(false),
            }),
            OpCode::Exists | OpCode::SetData => Ok(Response::Stat(Stat::read_from(reader)?)),
            OpCode::GetData => Ok(Response::GetData {
                bytes: reader.read_buffer()?,
                stat: Stat::read_from(reader)?,
            }),
            OpCode::GetChildren => Ok(Response::Strings(reader.read_string_list()?)),
            OpCode::Delete | OpCode::Check | OpCode::SetWatches => Ok(Response::Empty),
            OpCode::Create => Ok(Response::String(reader.read_string()?)),
            OpCode::Multi => {
                let mut results = Vec::new();
                loop {
                    let opcode = reader.read_i32::<BigEndian>()?;
                    let done = reader.read_u8()? != 0;
                    let _err = reader.read_i32::<BigEndian>()?;
                    if done {
                        break;
                    }
                    match OpCode::try_from(opcode) {
                        Ok(OpCode::Error) => {
                            let err = ZkError::from(reader.read_i32::<BigEndian>()?);
                            results.push(Err(err));
                        }
                        Ok(opcode) => results.push(Ok(Response::parse(opcode, reader)?)),
                        Err(code) => bail!("unknown opcode {} in multi response", code),
                    }
                }
                Ok(Response::Multi(results))
            }
            opcode => Err(format_err!("no response body defined for {:?}", opcode)),
        }
    }
}
