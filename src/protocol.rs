//! Framed wire protocol between frame sources and the perception server.
//!
//! Every message is length-prefixed: a 16-character zero-padded ASCII decimal
//! length, then exactly that many payload bytes. Scalars travel as decimal
//! text, strings as UTF-8. Images are a `"New Image"` sentinel followed by
//! width, height, format and the payload (raw pixel bytes for `"raw"`,
//! base64 text for encoded formats). Property bags are `"<name>:<type>:<value>"`
//! lines terminated by `"END"`.
//!
//! Channels are not reentrant: concurrent senders must hold an external lock.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::ProtocolError;
use crate::frame::{ImageData, PropValue, PropertyBag};

/// Socket buffer granularity for payload writes.
pub const BUF_SIZE: usize = 4096;

/// Width of the ASCII length field.
const LEN_FIELD: usize = 16;

const IMAGE_SENTINEL: &str = "New Image";
const BAG_TERMINATOR: &str = "END";

/// A blocking duplex byte stream with the framing rules above.
pub struct FramedChannel<S> {
    stream: S,
}

impl<S> FramedChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> FramedChannel<S> {
    /// Write the 16-digit length header, then the payload.
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let header = format!("{:016}", payload.len());
        self.stream.write_all(header.as_bytes())?;
        for chunk in payload.chunks(BUF_SIZE) {
            self.stream.write_all(chunk)?;
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Read exactly 16 header bytes, parse the length, then read exactly
    /// that many payload bytes (looping over short reads).
    pub fn recv_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut header = [0u8; LEN_FIELD];
        self.stream.read_exact(&mut header)?;
        let text = std::str::from_utf8(&header)
            .map_err(|_| ProtocolError::BadLength(String::from_utf8_lossy(&header).into_owned()))?;
        let len: usize = text
            .parse()
            .map_err(|_| ProtocolError::BadLength(text.to_string()))?;

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    pub fn send_int(&mut self, value: i64) -> Result<(), ProtocolError> {
        self.send_bytes(value.to_string().as_bytes())
    }

    pub fn recv_int(&mut self) -> Result<i64, ProtocolError> {
        let text = self.recv_str()?;
        text.trim().parse().map_err(|_| ProtocolError::BadScalar {
            kind: "int",
            text,
        })
    }

    pub fn send_float(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.send_bytes(value.to_string().as_bytes())
    }

    pub fn recv_float(&mut self) -> Result<f64, ProtocolError> {
        let text = self.recv_str()?;
        text.trim().parse().map_err(|_| ProtocolError::BadScalar {
            kind: "float",
            text,
        })
    }

    pub fn send_str(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.send_bytes(value.as_bytes())
    }

    pub fn recv_str(&mut self) -> Result<String, ProtocolError> {
        Ok(String::from_utf8(self.recv_bytes()?)?)
    }

    /// Send an image. For `"raw"` the pixel buffer travels as plain
    /// length-framed bytes; any other format is assumed to be already
    /// encoded (jpg, png, ...) and travels base64-ed as a string.
    pub fn send_image(
        &mut self,
        width: i64,
        height: i64,
        data: &[u8],
        format: &str,
    ) -> Result<(), ProtocolError> {
        self.send_str(IMAGE_SENTINEL)?;
        self.send_int(width)?;
        self.send_int(height)?;
        self.send_str(format)?;
        if format == "raw" {
            self.send_bytes(data)
        } else {
            self.send_str(&BASE64.encode(data))
        }
    }

    /// Block until the image sentinel appears, discarding any other strings,
    /// then read and decode width/height/format/payload.
    pub fn recv_image(&mut self) -> Result<ImageData, ProtocolError> {
        loop {
            let text = self.recv_str()?;
            if text == IMAGE_SENTINEL {
                break;
            }
            log::debug!("discarding stray string while waiting for image: {text:?}");
        }
        let width = self.recv_int()?;
        let height = self.recv_int()?;
        let format = self.recv_str()?;

        if format == "raw" {
            let data = self.recv_bytes()?;
            let (w, h) = (width.max(0) as u32, height.max(0) as u32);
            let pixels = (w as usize) * (h as usize);
            if pixels == 0 || data.len() % pixels != 0 {
                return Err(ProtocolError::BadImageShape {
                    len: data.len(),
                    width: w,
                    height: h,
                });
            }
            let channels = (data.len() / pixels) as u32;
            Ok(ImageData::new(w, h, channels, data))
        } else {
            // Encoded formats go through the external image codec.
            let encoded = BASE64.decode(self.recv_str()?)?;
            let decoded = image::load_from_memory(&encoded)?.to_rgb8();
            let (w, h) = (decoded.width(), decoded.height());
            Ok(ImageData::new(w, h, 3, decoded.into_raw()))
        }
    }

    /// Emit every property as a `"<name>:<type>:<value>"` line, then `"END"`.
    pub fn send_props(&mut self, props: &PropertyBag) -> Result<(), ProtocolError> {
        for (name, value) in props.iter() {
            self.send_str(&format!("{}:{}:{}", name, value.type_name(), value))?;
        }
        self.send_str(BAG_TERMINATOR)
    }

    /// Read strings until `"END"`, splitting each into at most 3 parts.
    /// Malformed lines (wrong arity, unknown type, unparseable value) are
    /// skipped silently.
    pub fn recv_props(&mut self) -> Result<PropertyBag, ProtocolError> {
        let mut props = PropertyBag::new();
        loop {
            let line = self.recv_str()?;
            if line == BAG_TERMINATOR {
                return Ok(props);
            }
            let mut parts = line.splitn(3, ':');
            let (name, ty, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(n), Some(t), Some(v)) => (n, t, v),
                _ => {
                    log::debug!("skipping malformed property line: {line:?}");
                    continue;
                }
            };
            let parsed = match ty {
                "str" => Some(PropValue::Str(value.to_string())),
                "int" => value.parse().ok().map(PropValue::Int),
                "float" => value.parse().ok().map(PropValue::Float),
                _ => None,
            };
            match parsed {
                Some(v) => props.insert(name, v),
                None => log::debug!("skipping malformed property line: {line:?}"),
            }
        }
    }
}
