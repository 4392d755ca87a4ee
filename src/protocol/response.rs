//! Response generator for the memcached text protocol.

use bytes::{BufMut, BytesMut};

/// Response lines understood by memcached clients.
pub struct Response;

impl Response {
    /// Append a `VALUE` block for one found key.
    ///
    /// Flags are not stored, so they are always reported as 0.
    pub fn value(key: &[u8], data: &[u8], out: &mut BytesMut) {
        let len = data.len().to_string();
        out.reserve(key.len() + len.len() + data.len() + 12);
        out.put_slice(b"VALUE ");
        out.put_slice(key);
        out.put_slice(b" 0 ");
        out.put_slice(len.as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(data);
        out.put_slice(b"\r\n");
    }

    /// Generate END response
    pub fn end() -> &'static [u8] {
        b"END\r\n"
    }

    /// Generate STORED response
    pub fn stored() -> &'static [u8] {
        b"STORED\r\n"
    }

    /// Generate NOT_STORED response
    pub fn not_stored() -> &'static [u8] {
        b"NOT_STORED\r\n"
    }

    /// Generate NOT_FOUND response
    pub fn not_found() -> &'static [u8] {
        b"NOT_FOUND\r\n"
    }

    /// Generate DELETED response
    pub fn deleted() -> &'static [u8] {
        b"DELETED\r\n"
    }

    /// Generate PONG response
    pub fn pong() -> &'static [u8] {
        b"PONG\r\n"
    }

    /// Generate an `ERROR <msg>` response for server-side failures
    pub fn error(msg: &str) -> BytesMut {
        Self::line("ERROR", msg)
    }

    /// Generate a `CLIENT_ERROR <msg>` response for malformed input
    pub fn client_error(msg: &str) -> BytesMut {
        Self::line("CLIENT_ERROR", msg)
    }

    fn line(kind: &str, msg: &str) -> BytesMut {
        let mut response = BytesMut::with_capacity(kind.len() + msg.len() + 3);
        response.put_slice(kind.as_bytes());
        response.put_u8(b' ');
        response.put_slice(msg.as_bytes());
        response.put_slice(b"\r\n");
        response
    }
}
