//! TLS ClientHello sniffing.
//!
//! The TCP router needs SNI and ALPN before deciding whether to pass the
//! connection through, terminate it, or hand it to plain HTTP. The hello is
//! parsed from peeked bytes without consuming the stream.

/// Result of inspecting the first bytes of a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelloInfo {
    pub is_tls: bool,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
}

/// Whether the buffer starts like a TLS record.
pub fn looks_like_tls(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == 0x16 && data[1] == 0x03
}

/// Number of bytes needed for the complete first TLS record, when known.
pub fn record_length(data: &[u8]) -> Option<usize> {
    if data.len() < 5 {
        return None;
    }
    Some(5 + usize::from(u16::from_be_bytes([data[3], data[4]])))
}

/// Parse SNI and ALPN out of a buffered ClientHello. Returns a non-TLS
/// `HelloInfo` when the buffer is not a TLS handshake, and best-effort
/// (possibly empty) fields when the hello is truncated or malformed.
pub fn parse_client_hello(data: &[u8]) -> HelloInfo {
    if !looks_like_tls(data) {
        return HelloInfo::default();
    }

    let mut info = HelloInfo {
        is_tls: true,
        server_name: None,
        alpn_protocols: Vec::new(),
    };

    let Some(extensions) = client_hello_extensions(data) else {
        return info;
    };

    let mut cursor = Cursor::new(extensions);
    while let (Some(ext_type), Some(ext_data)) = (cursor.read_u16(), cursor.read_u16_prefixed()) {
        match ext_type {
            // server_name
            0 => {
                let mut sni = Cursor::new(ext_data);
                // server_name_list length, then entry type (0 = host_name).
                if sni.read_u16().is_some() {
                    if sni.read_u8() == Some(0) {
                        if let Some(name) = sni.read_u16_prefixed() {
                            if let Ok(name) = std::str::from_utf8(name) {
                                info.server_name = Some(name.to_ascii_lowercase());
                            }
                        }
                    }
                }
            }
            // application_layer_protocol_negotiation
            16 => {
                let mut alpn = Cursor::new(ext_data);
                if let Some(list) = alpn.read_u16_prefixed() {
                    let mut protocols = Cursor::new(list);
                    while let Some(proto) = protocols.read_u8_prefixed() {
                        if let Ok(proto) = std::str::from_utf8(proto) {
                            info.alpn_protocols.push(proto.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    info
}

/// Walk the record and handshake headers down to the extensions block.
fn client_hello_extensions(data: &[u8]) -> Option<&[u8]> {
    let record_len = record_length(data)?;
    let record = data.get(5..record_len.min(data.len()))?;

    let mut cursor = Cursor::new(record);
    // Handshake type (1 = ClientHello) + 24-bit length.
    if cursor.read_u8()? != 1 {
        return None;
    }
    cursor.skip(3)?;
    // client_version + random.
    cursor.skip(2 + 32)?;
    // session_id, cipher_suites, compression_methods.
    cursor.read_u8_prefixed()?;
    cursor.read_u16_prefixed()?;
    cursor.read_u8_prefixed()?;

    cursor.read_u16_prefixed()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.data.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn read_u8_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = usize::from(self.read_u8()?);
        let slice = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }

    fn read_u16_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = usize::from(self.read_u16()?);
        let slice = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }
}
