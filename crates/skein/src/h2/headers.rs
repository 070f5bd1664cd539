//! Request header block validation, cf. RFC 9113, section 8

use bytes::Bytes;
use http::{
    header,
    uri::{Authority, Scheme},
    HeaderName, Method,
};

use super::types::{H2StreamError, HeaderList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeadersOrTrailers {
    Headers,
    Trailers,
}

/// A header block that passed validation
#[derive(Debug)]
pub(crate) struct CheckedHeaders {
    pub(crate) list: HeaderList,
    pub(crate) content_length: Option<u64>,
    pub(crate) expect_continue: bool,
}

/// Collects decoded header pairs one at a time, remembering the first
/// problem it finds. Decoding must run to completion regardless, to keep
/// the hpack dynamic table in sync.
pub(crate) struct HeaderChecker {
    kind: HeadersOrTrailers,
    list: HeaderList,
    error: Option<H2StreamError>,
    saw_regular_header: bool,

    method: Option<Method>,
    scheme: Option<Scheme>,
    path: Option<Bytes>,
    authority: Option<Authority>,
    content_length: Option<u64>,
    expect_continue: bool,
}

impl HeaderChecker {
    pub(crate) fn new(kind: HeadersOrTrailers) -> Self {
        Self {
            kind,
            list: Default::default(),
            error: None,
            saw_regular_header: false,
            method: None,
            scheme: None,
            path: None,
            authority: None,
            content_length: None,
            expect_continue: false,
        }
    }

    pub(crate) fn on_header_pair(&mut self, key: &[u8], value: &[u8]) {
        self.list
            .push((Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)));

        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.check_pair(key, value) {
            self.error = Some(e);
        }
    }

    fn check_pair(&mut self, key: &[u8], value: &[u8]) -> Result<(), H2StreamError> {
        if let Some(pseudo) = key.strip_prefix(b":") {
            if self.kind == HeadersOrTrailers::Trailers {
                return Err(H2StreamError::BadRequest(
                    "trailers must not contain pseudo-header fields (RFC 9113, section 8.1)",
                ));
            }
            if self.saw_regular_header {
                return Err(H2StreamError::BadRequest(
                    "All pseudo-header fields MUST appear in a field block before all regular field lines (RFC 9113, section 8.3)",
                ));
            }
            return self.check_pseudo_header(pseudo, value);
        }

        self.saw_regular_header = true;

        let name = HeaderName::from_bytes(key).map_err(|_| {
            H2StreamError::BadRequest("invalid header name. see RFC 9113, section 8.2.1, 'Field validity'")
        })?;

        // HeaderName lowercases on parse, so check the raw bytes
        if key.iter().any(|b| b.is_ascii_uppercase()) {
            return Err(H2StreamError::BadRequest(
                "A field name MUST NOT contain uppercase characters (RFC 9113, section 8.2.1, 'Field validity')",
            ));
        }

        // connection-specific headers are forbidden
        static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
        static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

        if name == header::CONNECTION
            || name == KEEP_ALIVE
            || name == PROXY_CONNECTION
            || name == header::TRANSFER_ENCODING
            || name == header::UPGRADE
        {
            return Err(H2StreamError::BadRequest(
                "connection-specific headers are forbidden. see RFC 9113, section 8.2.2",
            ));
        }

        if name == header::TE && value != b"trailers" {
            return Err(H2StreamError::BadRequest(
                "the TE header field MUST NOT contain any value other than 'trailers' (RFC 9113, section 8.2.2)",
            ));
        }

        let first = value.first();
        let last = value.last();
        if first == Some(&b' ')
            || first == Some(&b'\x09')
            || last == Some(&b' ')
            || last == Some(&b'\x09')
        {
            return Err(H2StreamError::BadRequest(
                "A field value MUST NOT start or end with an ASCII whitespace character (RFC 9113, section 8.2.1, 'Field validity')",
            ));
        }

        if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == b'\0') {
            return Err(H2StreamError::BadRequest(
                "A field value MUST NOT contain NUL, LF or CR (RFC 9113, section 8.2.1, 'Field validity')",
            ));
        }

        if self.kind == HeadersOrTrailers::Headers {
            if name == header::CONTENT_LENGTH {
                let len = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or(H2StreamError::BadRequest(
                        "content-length header is not a valid integer",
                    ))?;
                if self.content_length.replace(len).is_some_and(|prev| prev != len) {
                    return Err(H2StreamError::BadRequest(
                        "conflicting content-length headers",
                    ));
                }
            } else if name == header::EXPECT && value.eq_ignore_ascii_case(b"100-continue") {
                self.expect_continue = true;
            }
        }

        Ok(())
    }

    fn check_pseudo_header(&mut self, pseudo: &[u8], value: &[u8]) -> Result<(), H2StreamError> {
        const DUPLICATE: &str = "duplicate pseudo-header. All HTTP/2 requests MUST include _exactly one_ valid value for the ':method', ':scheme', and ':path' pseudo-header fields, unless they are CONNECT requests (RFC 9113, section 8.3.1)";

        match pseudo {
            b"method" => {
                let method = Method::from_bytes(value).map_err(|_| {
                    H2StreamError::BadRequest("invalid ':method' pseudo-header")
                })?;
                if self.method.replace(method).is_some() {
                    return Err(H2StreamError::BadRequest(DUPLICATE));
                }
            }
            b"scheme" => {
                let scheme = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<Scheme>().ok())
                    .ok_or(H2StreamError::BadRequest("invalid ':scheme' pseudo-header"))?;
                if self.scheme.replace(scheme).is_some() {
                    return Err(H2StreamError::BadRequest(DUPLICATE));
                }
            }
            b"path" => {
                if self.path.replace(Bytes::copy_from_slice(value)).is_some() {
                    return Err(H2StreamError::BadRequest(DUPLICATE));
                }
            }
            b"authority" => {
                let authority = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<Authority>().ok())
                    .ok_or(H2StreamError::BadRequest(
                        "invalid ':authority' pseudo-header: not a valid authority (RFC 3986, section 3.2)",
                    ))?;
                if self.authority.replace(authority).is_some() {
                    return Err(H2StreamError::BadRequest(DUPLICATE));
                }
            }
            _ => {
                return Err(H2StreamError::BadRequest(
                    "received invalid pseudo-header. the only defined request pseudo-headers are: ':method', ':scheme', ':path', ':authority' (RFC 9113, section 8.3.1)",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<CheckedHeaders, H2StreamError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        if self.kind == HeadersOrTrailers::Headers {
            let Some(method) = &self.method else {
                return Err(H2StreamError::BadRequest("missing :method pseudo-header"));
            };

            if *method == Method::CONNECT {
                // RFC 9113, section 8.5 'The CONNECT method': The ":scheme" and ":path"
                // pseudo-header fields MUST be omitted.
                if self.scheme.is_some() {
                    return Err(H2StreamError::BadRequest(
                        "CONNECT method MUST NOT include ':scheme' pseudo-header",
                    ));
                }
                if self.path.is_some() {
                    return Err(H2StreamError::BadRequest(
                        "CONNECT method MUST NOT include ':path' pseudo-header",
                    ));
                }
                if self.authority.is_none() {
                    return Err(H2StreamError::BadRequest(
                        "CONNECT method MUST include ':authority' pseudo-header",
                    ));
                }
            } else {
                let Some(scheme) = &self.scheme else {
                    return Err(H2StreamError::BadRequest("missing :scheme pseudo-header"));
                };
                let Some(path) = &self.path else {
                    return Err(H2StreamError::BadRequest("missing :path pseudo-header, cf. RFC9113, section 8.3.1"));
                };
                if path.is_empty() && (*scheme == Scheme::HTTP || *scheme == Scheme::HTTPS) {
                    return Err(H2StreamError::BadRequest(
                        "as per RFC9113, section 8.3.1, ':path' header value MUST NOT be empty for 'http' and 'https' URIs",
                    ));
                }
            }
        }

        Ok(CheckedHeaders {
            list: self.list,
            content_length: self.content_length,
            expect_continue: self.expect_continue,
        })
    }
}
