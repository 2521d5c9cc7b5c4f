//! Client for the patched QEMU unix-socket memory server.
//!
//! The wire protocol is a fixed little-endian frame:
//! `{type: u8, address: u64, length: u64}`. Type 0 quits the server,
//! type 1 reads (`length` data bytes followed by one status byte in the
//! reply), type 2 writes (header, then `length` payload bytes; one status
//! byte comes back). Status 1 is success, 0 is failure.

use std::{
    cell::RefCell,
    io::{Read as _, Write as _},
    os::unix::net::UnixStream,
    path::Path,
};

use crate::Error;

const REQUEST_QUIT: u8 = 0;
const REQUEST_READ: u8 = 1;
const REQUEST_WRITE: u8 = 2;

/// Size of one request frame on the wire.
pub const REQUEST_LEN: usize = 17;

/// One memory-server request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Request type: quit, read or write.
    pub typ: u8,

    /// Guest physical address to read from or write to.
    pub address: u64,

    /// Number of bytes to read or write.
    pub length: u64,
}

impl Request {
    /// Encodes the frame for the wire.
    pub fn to_bytes(self) -> [u8; REQUEST_LEN] {
        let mut frame = [0u8; REQUEST_LEN];
        frame[0] = self.typ;
        frame[1..9].copy_from_slice(&self.address.to_le_bytes());
        frame[9..17].copy_from_slice(&self.length.to_le_bytes());
        frame
    }
}

/// A connected memory-server client.
pub struct MemoryServer {
    stream: RefCell<UnixStream>,
}

impl MemoryServer {
    /// Connects to the server socket QEMU created for `pmemaccess`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
        let stream = UnixStream::connect(path)?;

        Ok(Self {
            stream: RefCell::new(stream),
        })
    }

    /// Reads guest physical memory.
    ///
    /// The server replies with `length` data bytes followed by a status
    /// byte; a zero status fails the whole read.
    pub fn read(&self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        let request = Request {
            typ: REQUEST_READ,
            address,
            length: length as u64,
        };

        let mut stream = self.stream.borrow_mut();
        stream.write_all(&request.to_bytes())?;

        let mut reply = vec![0u8; length + 1];
        stream.read_exact(&mut reply)?;

        match reply.pop() {
            Some(1) => Ok(reply),
            _ => Err(Error::MemoryServer),
        }
    }

    /// Writes guest physical memory. All or nothing.
    pub fn write(&self, address: u64, content: &[u8]) -> Result<(), Error> {
        let request = Request {
            typ: REQUEST_WRITE,
            address,
            length: content.len() as u64,
        };

        let mut stream = self.stream.borrow_mut();
        stream.write_all(&request.to_bytes())?;
        stream.write_all(content)?;

        let mut status = [0u8; 1];
        stream.read_exact(&mut status)?;

        match status[0] {
            1 => Ok(()),
            _ => Err(Error::MemoryServer),
        }
    }

    /// Asks the server to shut down.
    pub fn quit(&self) -> Result<(), Error> {
        let request = Request {
            typ: REQUEST_QUIT,
            address: 0,
            length: 0,
        };

        self.stream.borrow_mut().write_all(&request.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;

    #[test]
    fn request_frame_layout() {
        let frame = Request {
            typ: REQUEST_READ,
            address: 0x1000,
            length: 16,
        }
        .to_bytes();

        assert_eq!(frame.len(), 17);
        assert_eq!(frame[0], 1);
        assert_eq!(&frame[1..9], &0x1000u64.to_le_bytes());
        assert_eq!(&frame[9..17], &16u64.to_le_bytes());
    }

    /// Spawns a one-shot fake server that answers a single 16-byte read.
    #[test]
    fn read_reply_carries_trailing_status() -> Result<(), Error> {
        let mut path = std::env::temp_dir();
        path.push(format!("gvmi-memsrv-test-{}", std::process::id()));
        std::fs::remove_file(&path).ok();

        let listener = UnixListener::bind(&path)?;

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");

            let mut request = [0u8; REQUEST_LEN];
            stream.read_exact(&mut request).expect("request frame");
            assert_eq!(request[0], REQUEST_READ);

            let length = u64::from_le_bytes(request[9..17].try_into().unwrap());
            assert_eq!(length, 16);

            // 16 data bytes and the success status: exactly 17 bytes.
            let mut reply = vec![0xabu8; 16];
            reply.push(1);
            stream.write_all(&reply).expect("reply");
        });

        let client = MemoryServer::connect(&path)?;
        let data = client.read(0x1000, 16)?;

        assert_eq!(data.len(), 16);
        assert!(data.iter().all(|&b| b == 0xab));

        server.join().expect("server thread");
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn failed_read_status_is_an_error() -> Result<(), Error> {
        let mut path = std::env::temp_dir();
        path.push(format!("gvmi-memsrv-fail-{}", std::process::id()));
        std::fs::remove_file(&path).ok();

        let listener = UnixListener::bind(&path)?;

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");

            let mut request = [0u8; REQUEST_LEN];
            stream.read_exact(&mut request).expect("request frame");

            let mut reply = vec![0u8; 16];
            reply.push(0); // failure
            stream.write_all(&reply).expect("reply");
        });

        let client = MemoryServer::connect(&path)?;
        assert!(matches!(
            client.read(0x1000, 16),
            Err(Error::MemoryServer)
        ));

        server.join().expect("server thread");
        std::fs::remove_file(&path).ok();
        Ok(())
    }
}
