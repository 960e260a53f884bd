//! The wire protocol between clients and the storage server.  All
//! integers are unsigned 64-bit big-endian, except for the one-byte
//! opcodes and status codes.
//!
//! Requests are framed payloads (see [`crate::framer`]) that start
//! with an opcode:
//!
//! - open, lock, unlock, close, remove and read: `[op][path bytes]`,
//!   where the path length is implied by the payload length;
//! - write and append: `[op][path_len][contents_len][path][contents]`;
//! - read N files: `[op][N]`.
//!
//! Responses are not framed.  Simple requests get a single status
//! byte; read gets `[status][len][contents]` (or a lone error
//! status); write and append get `[status][evicted_count]` followed by
//! one `[path_len][contents_len][path][contents]` block per evicted
//! file; read N gets the same blocks, terminated by an 8-byte zero.
use std::io::Read;
use std::io::Result as IoResult;
use std::io::Write;
use thiserror::Error;

/// Unique identifiers for every operation in the request protocol.
/// The first two values are reserved for connection management, and
/// never appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    OpenFile = 2,
    OpenFileCreate = 3,
    OpenFileLock = 4,
    OpenFileCreateLock = 5,
    ReadFile = 6,
    ReadNFiles = 7,
    WriteFile = 8,
    AppendToFile = 9,
    LockFile = 10,
    UnlockFile = 11,
    CloseFile = 12,
    RemoveFile = 13,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;

        Some(match byte {
            2 => OpenFile,
            3 => OpenFileCreate,
            4 => OpenFileLock,
            5 => OpenFileCreateLock,
            6 => ReadFile,
            7 => ReadNFiles,
            8 => WriteFile,
            9 => AppendToFile,
            10 => LockFile,
            11 => UnlockFile,
            12 => CloseFile,
            13 => RemoveFile,
            _ => return None,
        })
    }
}

/// The first byte of every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Err = 1,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Status> {
        match byte {
            0 => Some(Status::Ok),
            1 => Some(Status::Err),
            _ => None,
        }
    }
}

impl<T, E> From<&std::result::Result<T, E>> for Status {
    fn from(result: &std::result::Result<T, E>) -> Status {
        if result.is_ok() {
            Status::Ok
        } else {
            Status::Err
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("malformed {0:?} request")]
    Malformed(Opcode),
    #[error("path is empty or not valid UTF-8")]
    BadPath,
}

/// A decoded request.  Each variant is handled by exactly one worker
/// function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// A zero-length payload.  Legal, and ignored.
    Nop,
    Open { path: String, create: bool, lock: bool },
    Read { path: String },
    /// `count == 0` means every file.
    ReadN { count: u64 },
    Write { path: String, contents: Vec<u8> },
    Append { path: String, contents: Vec<u8> },
    Lock { path: String },
    Unlock { path: String },
    Close { path: String },
    Remove { path: String },
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];

    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

/// Paths are non-empty UTF-8 strings.  An empty path would be
/// indistinguishable from the end of a read-N response.
fn path_from(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::BadPath);
    }

    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::BadPath)
}

/// Splits a two-argument payload (after the opcode) into its path and
/// contents.
fn split_pair(op: Opcode, args: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    if args.len() < 16 {
        return Err(ProtocolError::Malformed(op));
    }

    let path_len = read_u64(&args[0..8]);
    let contents_len = read_u64(&args[8..16]);
    let rest = &args[16..];
    // Compare without overflowing on hostile lengths.
    if path_len > rest.len() as u64 || contents_len != rest.len() as u64 - path_len {
        return Err(ProtocolError::Malformed(op));
    }

    let (path, contents) = rest.split_at(path_len as usize);
    Ok((path_from(path)?, contents.to_vec()))
}

impl Request {
    /// Decodes one framed payload.
    pub fn decode(payload: &[u8]) -> Result<Request, ProtocolError> {
        use Opcode::*;

        let (&byte, args) = match payload.split_first() {
            Some(split) => split,
            None => return Ok(Request::Nop),
        };
        let op = Opcode::from_byte(byte).ok_or(ProtocolError::UnknownOpcode(byte))?;

        Ok(match op {
            OpenFile | OpenFileCreate | OpenFileLock | OpenFileCreateLock => Request::Open {
                path: path_from(args)?,
                create: matches!(op, OpenFileCreate | OpenFileCreateLock),
                lock: matches!(op, OpenFileLock | OpenFileCreateLock),
            },
            ReadFile => Request::Read {
                path: path_from(args)?,
            },
            ReadNFiles => {
                if args.len() != 8 {
                    return Err(ProtocolError::Malformed(op));
                }

                Request::ReadN {
                    count: read_u64(args),
                }
            }
            WriteFile => {
                let (path, contents) = split_pair(op, args)?;
                Request::Write { path, contents }
            }
            AppendToFile => {
                let (path, contents) = split_pair(op, args)?;
                Request::Append { path, contents }
            }
            LockFile => Request::Lock {
                path: path_from(args)?,
            },
            UnlockFile => Request::Unlock {
                path: path_from(args)?,
            },
            CloseFile => Request::Close {
                path: path_from(args)?,
            },
            RemoveFile => Request::Remove {
                path: path_from(args)?,
            },
        })
    }

    /// Returns the opcode for this request, or `None` for `Nop`.
    pub fn opcode(&self) -> Option<Opcode> {
        use Opcode::*;

        Some(match self {
            Request::Nop => return None,
            Request::Open { create, lock, .. } => match (create, lock) {
                (false, false) => OpenFile,
                (true, false) => OpenFileCreate,
                (false, true) => OpenFileLock,
                (true, true) => OpenFileCreateLock,
            },
            Request::Read { .. } => ReadFile,
            Request::ReadN { .. } => ReadNFiles,
            Request::Write { .. } => WriteFile,
            Request::Append { .. } => AppendToFile,
            Request::Lock { .. } => LockFile,
            Request::Unlock { .. } => UnlockFile,
            Request::Close { .. } => CloseFile,
            Request::Remove { .. } => RemoveFile,
        })
    }

    /// Encodes the request payload, without the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut ret = Vec::new();

        if let Some(op) = self.opcode() {
            ret.push(op as u8);
        }

        match self {
            Request::Nop => {}
            Request::Open { path, .. }
            | Request::Read { path }
            | Request::Lock { path }
            | Request::Unlock { path }
            | Request::Close { path }
            | Request::Remove { path } => ret.extend_from_slice(path.as_bytes()),
            Request::ReadN { count } => ret.extend_from_slice(&count.to_be_bytes()),
            Request::Write { path, contents } | Request::Append { path, contents } => {
                ret.extend_from_slice(&(path.len() as u64).to_be_bytes());
                ret.extend_from_slice(&(contents.len() as u64).to_be_bytes());
                ret.extend_from_slice(path.as_bytes());
                ret.extend_from_slice(contents);
            }
        }

        ret
    }
}

pub fn write_status(out: &mut impl Write, status: Status) -> IoResult<()> {
    out.write_all(&[status as u8])
}

pub fn write_u64(out: &mut impl Write, value: u64) -> IoResult<()> {
    out.write_all(&value.to_be_bytes())
}

/// Writes one `[path_len][contents_len][path][contents]` block.
pub fn write_file_block(out: &mut impl Write, path: &str, contents: &[u8]) -> IoResult<()> {
    write_u64(out, path.len() as u64)?;
    write_u64(out, contents.len() as u64)?;
    out.write_all(path.as_bytes())?;
    out.write_all(contents)
}

pub fn read_status(input: &mut impl Read) -> IoResult<Option<Status>> {
    let mut buf = [0u8; 1];

    input.read_exact(&mut buf)?;
    Ok(Status::from_byte(buf[0]))
}

pub fn read_u64_from(input: &mut impl Read) -> IoResult<u64> {
    let mut buf = [0u8; 8];

    input.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Reads a block of `len` raw bytes.
pub fn read_bytes(input: &mut impl Read, len: u64) -> IoResult<Vec<u8>> {
    let mut ret = Vec::new();

    input.take(len).read_to_end(&mut ret)?;
    if (ret.len() as u64) < len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }

    Ok(ret)
}

#[test]
fn test_decode_simple() {
    let mut payload = vec![Opcode::LockFile as u8];
    payload.extend_from_slice(b"/tmp/a");

    assert_eq!(
        Request::decode(&payload),
        Ok(Request::Lock {
            path: "/tmp/a".to_owned()
        })
    );
}

#[test]
fn test_decode_open_variants() {
    for (byte, create, lock) in [
        (2u8, false, false),
        (3, true, false),
        (4, false, true),
        (5, true, true),
    ] {
        let payload = [byte, b'x'];
        assert_eq!(
            Request::decode(&payload),
            Ok(Request::Open {
                path: "x".to_owned(),
                create,
                lock
            })
        );
    }
}

#[test]
fn test_decode_empty_is_nop() {
    assert_eq!(Request::decode(&[]), Ok(Request::Nop));
    assert!(Request::Nop.encode().is_empty());
}

#[test]
fn test_decode_write() {
    let mut payload = vec![Opcode::WriteFile as u8];
    payload.extend_from_slice(&3u64.to_be_bytes());
    payload.extend_from_slice(&4u64.to_be_bytes());
    payload.extend_from_slice(b"abcdata");

    assert_eq!(
        Request::decode(&payload),
        Ok(Request::Write {
            path: "abc".to_owned(),
            contents: b"data".to_vec()
        })
    );
}

/// Argument lengths must add up exactly to the payload length.
#[test]
fn test_decode_write_bad_lengths() {
    let mut payload = vec![Opcode::AppendToFile as u8];
    payload.extend_from_slice(&3u64.to_be_bytes());
    payload.extend_from_slice(&5u64.to_be_bytes());
    payload.extend_from_slice(b"abcdata");
    assert_eq!(
        Request::decode(&payload),
        Err(ProtocolError::Malformed(Opcode::AppendToFile))
    );

    // Huge lengths must not overflow.
    let mut payload = vec![Opcode::WriteFile as u8];
    payload.extend_from_slice(&u64::MAX.to_be_bytes());
    payload.extend_from_slice(&2u64.to_be_bytes());
    payload.extend_from_slice(b"ab");
    assert_eq!(
        Request::decode(&payload),
        Err(ProtocolError::Malformed(Opcode::WriteFile))
    );

    // Too short for the two lengths.
    assert_eq!(
        Request::decode(&[Opcode::WriteFile as u8, 0, 0]),
        Err(ProtocolError::Malformed(Opcode::WriteFile))
    );
}

#[test]
fn test_decode_read_n() {
    let mut payload = vec![Opcode::ReadNFiles as u8];
    payload.extend_from_slice(&7u64.to_be_bytes());
    assert_eq!(Request::decode(&payload), Ok(Request::ReadN { count: 7 }));

    assert_eq!(
        Request::decode(&[Opcode::ReadNFiles as u8, 1]),
        Err(ProtocolError::Malformed(Opcode::ReadNFiles))
    );
}

#[test]
fn test_decode_errors() {
    assert_eq!(
        Request::decode(&[0]),
        Err(ProtocolError::UnknownOpcode(0))
    );
    assert_eq!(
        Request::decode(&[200, b'a']),
        Err(ProtocolError::UnknownOpcode(200))
    );
    assert_eq!(
        Request::decode(&[Opcode::CloseFile as u8, 0xff, 0xfe]),
        Err(ProtocolError::BadPath)
    );
    assert_eq!(
        Request::decode(&[Opcode::RemoveFile as u8]),
        Err(ProtocolError::BadPath)
    );
}

/// Every request type decodes back to itself.
#[test]
fn test_encode_decode() {
    let requests = vec![
        Request::Open {
            path: "a".to_owned(),
            create: true,
            lock: false,
        },
        Request::Read {
            path: "b".to_owned(),
        },
        Request::ReadN { count: 0 },
        Request::Write {
            path: "c".to_owned(),
            contents: vec![1, 2, 3],
        },
        Request::Append {
            path: "d".to_owned(),
            contents: vec![],
        },
        Request::Lock {
            path: "e".to_owned(),
        },
        Request::Unlock {
            path: "f".to_owned(),
        },
        Request::Close {
            path: "g".to_owned(),
        },
        Request::Remove {
            path: "h".to_owned(),
        },
    ];

    for request in requests {
        assert_eq!(Request::decode(&request.encode()), Ok(request));
    }
}

#[test]
fn test_file_block() {
    let mut out = Vec::new();
    write_file_block(&mut out, "ab", b"xyz").expect("write to vec must succeed");

    let mut input = &out[..];
    assert_eq!(read_u64_from(&mut input).expect("must read"), 2);
    assert_eq!(read_u64_from(&mut input).expect("must read"), 3);
    assert_eq!(read_bytes(&mut input, 2).expect("must read"), b"ab");
    assert_eq!(read_bytes(&mut input, 3).expect("must read"), b"xyz");
    assert!(read_bytes(&mut input, 1).is_err());
}
