//! One LDAP connection: request encoding, response framing and per-message-id
//! buffering. Implements [`MessageSource`] for the result decoder.

use crate::controls::ControlsContext;
use crate::decoder::{fetch_results, LdapResult, MessageId, MessageSource, ResultItem, WaitMode};
use crate::error::{LdapError, Result};
use crate::ldap_protocol::{
    encode_ldap_message, op_name, parse_ldap_message, AddRequest, Attribute, BerReader, BerWriter,
    BindRequest, CompareRequest, DelRequest, ExtendedRequest, LdapMessage, ModifyChange,
    ModifyDNRequest, ModifyRequest, ProtocolOp, SearchRequest, LDAP_MESSAGE_SEQUENCE_TAG,
};
use crate::result_code::{self, err2string};
use async_trait::async_trait;
use bytes::BytesMut;
use rustls_pki_types::ServerName;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const PASSWD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
pub const CANCEL_OID: &str = "1.3.6.1.1.8";
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Largest LDAPMessage accepted from the server unless configured otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const DEFAULT_PORT: u16 = 389;
const DEFAULT_TLS_PORT: u16 = 636;

/// Connection to the directory: plain TCP (ldap://) or TLS (ldaps://).
pub enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Limit for TCP connect plus TLS handshake.
    pub network_timeout: Option<Duration>,
    pub ca_file: Option<String>,
    pub tls_skip_verify: bool,
    /// Upgrade a plain ldap:// connection with StartTLS before returning it.
    pub start_tls: bool,
    /// Overrides [`DEFAULT_MAX_MESSAGE_SIZE`].
    pub max_message_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `ldap://host[:port][/...]` or `ldaps://...`. An empty host means localhost.
pub fn parse_ldap_uri(uri: &str) -> Result<LdapUrl> {
    let bad_uri = || LdapError::protocol_with_text(result_code::PARAM_ERROR, format!("Bad LDAP URI: {}", uri));
    let lower = uri.to_ascii_lowercase();
    let (rest, tls) = if lower.starts_with("ldaps://") {
        (&uri["ldaps://".len()..], true)
    } else if lower.starts_with("ldap://") {
        (&uri["ldap://".len()..], false)
    } else {
        return Err(bad_uri());
    };
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(bad_uri)?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad_uri())?,
            None if after.is_empty() => default_port,
            None => return Err(bad_uri()),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, p)) => (host, p.parse().map_err(|_| bad_uri())?),
            None => (authority, default_port),
        }
    };
    let host = if host.is_empty() { "localhost" } else { host };
    Ok(LdapUrl {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Exclusive owner of one connection. Every method takes `&mut self`, so at
/// most one fetch runs per session at a time.
pub struct Session<S = LdapStream> {
    stream: S,
    read_buf: BytesMut,
    next_id: i32,
    /// Operations whose terminal message has not been handed out yet.
    outstanding: HashMap<i32, &'static str>,
    /// Routed messages in arrival order.
    pending: VecDeque<LdapMessage>,
    max_message_size: usize,
}

impl Session<LdapStream> {
    pub async fn connect(uri: &str, options: &ConnectOptions) -> Result<Self> {
        let url = parse_ldap_uri(uri)?;
        let handshake = open_stream(&url, options);
        let stream = match options.network_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| LdapError::Timeout)??,
            None => handshake.await?,
        };
        info!("Connected to {}:{}{}", url.host, url.port, if url.tls { " (TLS)" } else { "" });
        let mut session = Session::new(stream);
        if let Some(max) = options.max_message_size {
            session = session.with_max_message_size(max);
        }
        if options.start_tls && !url.tls {
            session = session.start_tls(&url.host, options).await?;
        }
        Ok(session)
    }

    /// RFC 4513 StartTLS: ask the server to switch, then run the TLS
    /// handshake on the same TCP connection. No operation may be in flight.
    pub async fn start_tls(mut self, host: &str, options: &ConnectOptions) -> Result<Self> {
        if matches!(self.stream, LdapStream::Tls(_)) {
            return Err(LdapError::protocol_with_text(
                result_code::LOCAL_ERROR,
                "StartTLS on a connection that already uses TLS",
            ));
        }
        self.request_start_tls(options.network_timeout).await?;
        if !self.read_buf.is_empty() || !self.pending.is_empty() {
            return Err(LdapError::protocol_with_text(
                result_code::LOCAL_ERROR,
                "StartTLS: unexpected data before the TLS handshake",
            ));
        }

        let Session {
            stream,
            read_buf,
            next_id,
            outstanding,
            pending,
            max_message_size,
        } = self;
        let tcp = match stream {
            LdapStream::Tcp(tcp) => tcp,
            LdapStream::Tls(_) => {
                return Err(LdapError::protocol(result_code::LOCAL_ERROR));
            }
        };
        let handshake = tls_handshake(host, tcp, options);
        let stream = match options.network_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| LdapError::Timeout)??,
            None => handshake.await?,
        };
        info!("StartTLS with {} complete", host);
        Ok(Session {
            stream,
            read_buf,
            next_id,
            outstanding,
            pending,
            max_message_size,
        })
    }
}

async fn open_stream(url: &LdapUrl, options: &ConnectOptions) -> Result<LdapStream> {
    let addr = format!("{}:{}", url.host, url.port);
    let tcp = TcpStream::connect(&addr).await?;
    if !url.tls {
        return Ok(LdapStream::Tcp(tcp));
    }
    tls_handshake(&url.host, tcp, options).await
}

async fn tls_handshake(host: &str, tcp: TcpStream, options: &ConnectOptions) -> Result<LdapStream> {
    let connect_error = |text: String| LdapError::protocol_with_text(result_code::CONNECT_ERROR, text);
    let config = crate::tls::client_config(options.ca_file.as_deref(), options.tls_skip_verify)
        .map_err(|e| connect_error(format!("TLS setup failed: {:#}", e)))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| connect_error(format!("Invalid hostname for TLS SNI: {}", host)))?;
    let tls = TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| connect_error(format!("TLS handshake with {} failed: {}", host, e)))?;
    Ok(LdapStream::Tls(Box::new(tls)))
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            next_id: 1,
            outstanding: HashMap::new(),
            pending: VecDeque::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Reject server messages larger than `max` bytes with a decoding error.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn is_outstanding(&self, id: i32) -> bool {
        self.outstanding.contains_key(&id)
    }

    pub async fn simple_bind(
        &mut self,
        dn: &str,
        password: &[u8],
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let op = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: dn.to_string(),
            password: password.to_vec(),
        });
        self.start(op, controls).await
    }

    pub async fn search(&mut self, request: &SearchRequest, controls: Option<&ControlsContext>) -> Result<i32> {
        self.start(ProtocolOp::SearchRequest(request.clone()), controls)
            .await
    }

    pub async fn add(
        &mut self,
        dn: &str,
        attributes: Vec<Attribute>,
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let op = ProtocolOp::AddRequest(AddRequest {
            entry: dn.to_string(),
            attributes,
        });
        self.start(op, controls).await
    }

    pub async fn modify(
        &mut self,
        dn: &str,
        changes: Vec<ModifyChange>,
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let op = ProtocolOp::ModifyRequest(ModifyRequest {
            object: dn.to_string(),
            changes,
        });
        self.start(op, controls).await
    }

    pub async fn delete(&mut self, dn: &str, controls: Option<&ControlsContext>) -> Result<i32> {
        let op = ProtocolOp::DelRequest(DelRequest {
            entry: dn.to_string(),
        });
        self.start(op, controls).await
    }

    pub async fn rename(
        &mut self,
        dn: &str,
        newrdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let op = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
            entry: dn.to_string(),
            newrdn: newrdn.to_string(),
            delete_old_rdn,
            new_superior: new_superior.map(str::to_string),
        });
        self.start(op, controls).await
    }

    pub async fn compare(
        &mut self,
        dn: &str,
        attr: &str,
        value: &[u8],
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let op = ProtocolOp::CompareRequest(CompareRequest {
            entry: dn.to_string(),
            attr: attr.to_string(),
            assertion_value: value.to_vec(),
        });
        self.start(op, controls).await
    }

    pub async fn extended(
        &mut self,
        oid: &str,
        value: Option<Vec<u8>>,
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: oid.to_string(),
            request_value: value,
        });
        self.start(op, controls).await
    }

    /// Send the StartTLS extended request and wait for a success result. The
    /// stream itself is upgraded by [`Session::start_tls`].
    pub async fn request_start_tls(&mut self, timeout: Option<Duration>) -> Result<()> {
        if !self.outstanding.is_empty() {
            return Err(LdapError::protocol_with_text(
                result_code::LOCAL_ERROR,
                format!("StartTLS with {} operation(s) outstanding", self.outstanding.len()),
            ));
        }
        let id = self.extended(STARTTLS_OID, None, None).await?;
        self.result(id, timeout, None).await?.success()?;
        Ok(())
    }

    /// RFC 4532 "Who am I?".
    pub async fn whoami(&mut self, controls: Option<&ControlsContext>) -> Result<i32> {
        self.extended(WHOAMI_OID, None, controls).await
    }

    /// RFC 3062 password modify. With no new password the server may generate one.
    pub async fn passwd(
        &mut self,
        user: Option<&str>,
        old_password: Option<&[u8]>,
        new_password: Option<&[u8]>,
        controls: Option<&ControlsContext>,
    ) -> Result<i32> {
        let value = if user.is_none() && old_password.is_none() && new_password.is_none() {
            None
        } else {
            let mut writer = BerWriter::new();
            let seq = writer.start_sequence();
            if let Some(user) = user {
                writer.write_tagged(0x80, user.as_bytes());
            }
            if let Some(old) = old_password {
                writer.write_tagged(0x81, old);
            }
            if let Some(new) = new_password {
                writer.write_tagged(0x82, new);
            }
            writer.end_sequence(seq);
            Some(writer.into_vec())
        };
        self.extended(PASSWD_MODIFY_OID, value, controls).await
    }

    /// RFC 3909 cancel. Unlike abandon, the cancelled operation still gets a response.
    pub async fn cancel(&mut self, id: i32, controls: Option<&ControlsContext>) -> Result<i32> {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(id);
        writer.end_sequence(seq);
        self.extended(CANCEL_OID, Some(writer.into_vec()), controls)
            .await
    }

    /// Abandon `id` and drop everything buffered or still to arrive for it.
    pub async fn abandon(&mut self, id: i32) -> Result<()> {
        self.write_request(ProtocolOp::AbandonRequest(id), None)
            .await?;
        self.outstanding.remove(&id);
        let before = self.pending.len();
        self.pending.retain(|m| m.message_id != id);
        debug!(
            "Abandoned message {} ({} buffered messages dropped)",
            id,
            before - self.pending.len()
        );
        Ok(())
    }

    pub async fn unbind(mut self) -> Result<()> {
        self.write_request(ProtocolOp::UnbindRequest, None).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Wait for the terminal result of `id`, discarding any entries.
    pub async fn result(
        &mut self,
        id: i32,
        timeout: Option<Duration>,
        controls: Option<&mut ControlsContext>,
    ) -> Result<LdapResult> {
        let items = fetch_results(self, MessageId::Id(id), WaitMode::All, timeout, controls).await?;
        items
            .into_iter()
            .rev()
            .find_map(|item| match item {
                ResultItem::Done(result) => Some(result),
                ResultItem::Entry(_) => None,
            })
            .ok_or_else(|| LdapError::MalformedMessage(format!("no terminal result for message {}", id)))
    }

    async fn start(&mut self, op: ProtocolOp, controls: Option<&ControlsContext>) -> Result<i32> {
        let name = op_name(&op);
        let id = self.write_request(op, controls).await?;
        self.outstanding.insert(id, name);
        Ok(id)
    }

    async fn write_request(&mut self, op: ProtocolOp, controls: Option<&ControlsContext>) -> Result<i32> {
        let id = self.next_message_id();
        let mut message = LdapMessage::new(id, op);
        if let Some(ctx) = controls {
            if !ctx.server_controls().is_empty() {
                message.controls = Some(ctx.server_controls().to_vec());
            }
        }
        let bytes = encode_ldap_message(&message).map_err(|e| {
            LdapError::protocol_with_text(
                result_code::ENCODING_ERROR,
                format!("{}: {:#}", err2string(result_code::ENCODING_ERROR), e),
            )
        })?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        debug!("Sent {} as message {} ({} bytes)", op_name(&message.protocol_op), id, bytes.len());
        Ok(id)
    }

    fn next_message_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Read once from the stream into the frame buffer.
    async fn fill_buffer(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(LdapError::protocol_with_text(
                result_code::SERVER_DOWN,
                format!("{}: connection closed", err2string(result_code::SERVER_DOWN)),
            ));
        }
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Parse every complete frame already buffered, without further I/O.
    fn route_buffered_frames(&mut self) -> Result<()> {
        while let Some(total) = frame_length(&self.read_buf, self.max_message_size)? {
            let frame = self.read_buf.split_to(total);
            let message = parse_ldap_message(&frame).map_err(|e| {
                warn!("Unparseable LDAP message ({} bytes): {:#}", frame.len(), e);
                LdapError::protocol_with_text(
                    result_code::DECODING_ERROR,
                    format!("{}: {:#}", err2string(result_code::DECODING_ERROR), e),
                )
            })?;
            self.route(message);
        }
        Ok(())
    }

    fn route(&mut self, message: LdapMessage) {
        let id = message.message_id;
        if id == 0 {
            warn!("Unsolicited notification: {}", op_name(&message.protocol_op));
            self.pending.push_back(message);
        } else if self.outstanding.contains_key(&id) {
            self.pending.push_back(message);
        } else {
            debug!(
                "Discarding {} for abandoned or unknown message {}",
                op_name(&message.protocol_op),
                id
            );
        }
    }

    fn select_batch(&mut self, msgid: MessageId, mode: WaitMode) -> Option<Vec<LdapMessage>> {
        let batch: Vec<LdapMessage> = match mode {
            WaitMode::One => {
                let pos = self.pending.iter().position(|m| msgid.matches(m.message_id))?;
                self.pending.remove(pos).into_iter().collect()
            }
            WaitMode::All => {
                let target = self
                    .pending
                    .iter()
                    .find(|m| msgid.matches(m.message_id) && m.is_terminal())?
                    .message_id;
                self.take_until_terminal(|id| id == target)
            }
            WaitMode::Received => {
                if !self.pending.iter().any(|m| msgid.matches(m.message_id)) {
                    return None;
                }
                self.take_until_terminal(|id| msgid.matches(id))
            }
        };
        for message in batch.iter().filter(|m| m.is_terminal()) {
            if let Some(op) = self.outstanding.remove(&message.message_id) {
                debug!("{} message {} completed", op, message.message_id);
            }
        }
        Some(batch)
    }

    /// Remove matching messages in arrival order, up to and including the
    /// first terminal one. Everything else stays buffered in order.
    fn take_until_terminal(&mut self, wanted: impl Fn(i32) -> bool) -> Vec<LdapMessage> {
        let mut batch = Vec::new();
        let mut rest = VecDeque::with_capacity(self.pending.len());
        let mut done = false;
        for message in self.pending.drain(..) {
            if !done && wanted(message.message_id) {
                done = message.is_terminal();
                batch.push(message);
            } else {
                rest.push_back(message);
            }
        }
        self.pending = rest;
        batch
    }

    /// Fail instead of blocking when nothing can ever match.
    fn ensure_waitable(&self, msgid: MessageId) -> Result<()> {
        match msgid {
            MessageId::Id(id) if !self.outstanding.contains_key(&id) => {
                Err(LdapError::protocol(result_code::NO_SUCH_OPERATION))
            }
            MessageId::Any if self.outstanding.is_empty() => {
                Err(LdapError::protocol(result_code::NO_RESULTS_RETURNED))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S> MessageSource for Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_batch(
        &mut self,
        msgid: MessageId,
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<LdapMessage>>> {
        // A deadline too far away to represent blocks like no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            self.route_buffered_frames()?;
            if let Some(batch) = self.select_batch(msgid, mode) {
                return Ok(Some(batch));
            }
            self.ensure_waitable(msgid)?;
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.fill_buffer()).await {
                    Ok(read) => read?,
                    Err(_) => return Ok(None),
                },
                None => self.fill_buffer().await?,
            }
        }
    }
}

/// Length of the first complete LDAPMessage in `buf`, or `None` when more
/// bytes are needed. A declared length above `max` is an error as soon as
/// the header is readable.
pub(crate) fn frame_length(buf: &[u8], max: usize) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let framing_error = |text: &str| {
        LdapError::protocol_with_text(
            result_code::DECODING_ERROR,
            format!("{}: {}", err2string(result_code::DECODING_ERROR), text),
        )
    };
    if buf[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        return Err(framing_error("message is not a SEQUENCE"));
    }
    let first_byte = buf[1];
    let total = if first_byte & 0x80 == 0 {
        2 + first_byte as usize
    } else {
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            return Err(framing_error("unsupported length encoding"));
        }
        if buf.len() < 2 + length_bytes {
            return Ok(None);
        }
        let length = buf[2..2 + length_bytes]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        2 + length_bytes + length
    };
    if total > max {
        return Err(framing_error(&format!("message of {} bytes exceeds limit of {}", total, max)));
    }
    Ok((buf.len() >= total).then_some(total))
}

/// Authorization identity from a "Who am I?" result; empty means anonymous.
pub fn whoami_identity(result: &LdapResult) -> Option<String> {
    result
        .extended_data
        .as_deref()
        .map(|data| String::from_utf8_lossy(data).into_owned())
}

/// Server-generated password from a password modify result, if any.
pub fn generated_password(result: &LdapResult) -> Result<Option<Vec<u8>>> {
    let data = match result.extended_data.as_deref() {
        Some(data) if !data.is_empty() => data,
        _ => return Ok(None),
    };
    let parse = || -> anyhow::Result<Option<Vec<u8>>> {
        let mut reader = BerReader::new(data);
        let mut seq = reader.read_sequence()?;
        if seq.peek_tag() == Some(0x80) {
            return Ok(Some(seq.read_octet_string()?));
        }
        Ok(None)
    };
    parse().map_err(|e| LdapError::MalformedMessage(format!("password modify response: {}", e)))
}
