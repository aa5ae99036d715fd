// LDAP protocol handling with BER encoding/decoding
// Client side of LDAPv3 (RFC 4511): requests are encoded, responses are parsed.

use crate::filter::Filter;
use anyhow::{bail, Context, Result};
use std::io::{Cursor, Read};
use std::str::FromStr;

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(ctype: impl Into<String>, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            ctype: ctype.into(),
            critical,
            value,
        }
    }
}

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(ResultPdu),
    ModifyRequest(ModifyRequest),
    ModifyResponse(ResultPdu),
    AddRequest(AddRequest),
    AddResponse(ResultPdu),
    DelRequest(DelRequest),
    DelResponse(ResultPdu),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(ResultPdu),
    CompareRequest(CompareRequest),
    CompareResponse(ResultPdu),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
    /// Response PDU with an application tag this client does not know.
    Unrecognized { tag: u8 },
}

/// Closed set of message kinds the result decoder dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    SearchEntry,
    SearchResult,
    /// Terminal response of a single-response operation (bind, add, modify, ...).
    SingleShotDone,
    ExtendedResponse,
    Other,
}

impl MessageKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageKind::SearchResult | MessageKind::SingleShotDone | MessageKind::ExtendedResponse
        )
    }
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.protocol_op {
            ProtocolOp::SearchResultEntry(_) => MessageKind::SearchEntry,
            ProtocolOp::SearchResultDone(_) => MessageKind::SearchResult,
            ProtocolOp::BindResponse(_)
            | ProtocolOp::ModifyResponse(_)
            | ProtocolOp::AddResponse(_)
            | ProtocolOp::DelResponse(_)
            | ProtocolOp::ModifyDNResponse(_)
            | ProtocolOp::CompareResponse(_) => MessageKind::SingleShotDone,
            ProtocolOp::ExtendedResponse(_) => MessageKind::ExtendedResponse,
            _ => MessageKind::Other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// Short operation name for logs.
pub fn op_name(op: &ProtocolOp) -> &'static str {
    match op {
        ProtocolOp::BindRequest(_) => "BIND",
        ProtocolOp::BindResponse(_) => "BIND_RESPONSE",
        ProtocolOp::UnbindRequest => "UNBIND",
        ProtocolOp::SearchRequest(_) => "SEARCH",
        ProtocolOp::SearchResultEntry(_) => "SEARCH_ENTRY",
        ProtocolOp::SearchResultReference(_) => "SEARCH_REFERENCE",
        ProtocolOp::SearchResultDone(_) => "SEARCH_DONE",
        ProtocolOp::ModifyRequest(_) => "MODIFY",
        ProtocolOp::ModifyResponse(_) => "MODIFY_RESPONSE",
        ProtocolOp::AddRequest(_) => "ADD",
        ProtocolOp::AddResponse(_) => "ADD_RESPONSE",
        ProtocolOp::DelRequest(_) => "DELETE",
        ProtocolOp::DelResponse(_) => "DELETE_RESPONSE",
        ProtocolOp::ModifyDNRequest(_) => "MODDN",
        ProtocolOp::ModifyDNResponse(_) => "MODDN_RESPONSE",
        ProtocolOp::CompareRequest(_) => "COMPARE",
        ProtocolOp::CompareResponse(_) => "COMPARE_RESPONSE",
        ProtocolOp::AbandonRequest(_) => "ABANDON",
        ProtocolOp::ExtendedRequest(_) => "EXTENDED",
        ProtocolOp::ExtendedResponse(_) => "EXTENDED_RESPONSE",
        ProtocolOp::IntermediateResponse(_) => "INTERMEDIATE",
        ProtocolOp::Unrecognized { .. } => "UNRECOGNIZED",
    }
}

/// LDAPResult components shared by every terminal response.
#[derive(Debug, Clone, Default)]
pub struct ResultPdu {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl ResultPdu {
    pub fn new(result_code: i32, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            diagnostic_message: diagnostic_message.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub password: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BindResponse {
    pub result: ResultPdu,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Search with no limits, never dereferencing aliases.
    pub fn new(base_object: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_object: base_object.into(),
            scope,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
    /// draft-sermersheim-ldap-subordinate-scope
    Subordinate = 3,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            3 => Ok(SearchScope::Subordinate),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

impl FromStr for SearchScope {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(SearchScope::BaseObject),
            "one" | "onelevel" => Ok(SearchScope::SingleLevel),
            "sub" | "subtree" => Ok(SearchScope::WholeSubtree),
            "children" | "subordinate" => Ok(SearchScope::Subordinate),
            _ => bail!("Invalid search scope: {}", s),
        }
    }
}

/// Entry as it arrives on the wire. DN and attribute types are kept as raw
/// octets; the decoder validates them.
#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: Vec<u8>,
    pub attributes: Vec<EntryAttribute>,
}

#[derive(Debug, Clone)]
pub struct EntryAttribute {
    pub attr_type: Vec<u8>,
    pub attr_values: Vec<Vec<u8>>,
}

impl EntryAttribute {
    pub fn new(attr_type: &str, attr_values: Vec<Vec<u8>>) -> Self {
        Self {
            attr_type: attr_type.as_bytes().to_vec(),
            attr_values,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    /// RFC 4525
    Increment = 3,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtendedResponse {
    pub result: ResultPdu,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<V: AsRef<[u8]>>(attr_type: impl Into<String>, values: &[V]) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: values.iter().map(|v| v.as_ref().to_vec()).collect(),
        }
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    pub(crate) cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .context("BER truncated: missing tag")?;
        Ok(buf[0])
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .context("BER truncated: missing length")?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!(
                    "BER truncated: length encoding needs {} bytes, {} remaining",
                    length_bytes,
                    self.remaining()
                );
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    /// Borrow the next `n` content bytes and advance past them.
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    /// Read any TLV and return its tag with a reader bounded to its content.
    pub(crate) fn read_element(&mut self) -> Result<(u8, BerReader<'a>)> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let content = self.take(length)?;
        Ok((tag, BerReader::new(content)))
    }

    /// Read a TLV with exactly `tag` and return a reader over its content.
    pub(crate) fn expect(&mut self, tag: u8) -> Result<BerReader<'a>> {
        let (actual, content) = self.read_element()?;
        if actual != tag {
            bail!("Expected tag 0x{:02X}, got: 0x{:02X}", tag, actual);
        }
        Ok(content)
    }

    pub(crate) fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        self.expect(0x30)
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if tag != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        self.read_integer_value()
    }

    /// Length + content of an INTEGER-like value (tag already consumed).
    pub(crate) fn read_integer_value(&mut self) -> Result<i32> {
        let length = self.read_length()?;
        let bytes = self.take(length)?;
        decode_integer(bytes)
    }

    /// Read OCTET STRING TLV. Accepts 0x04 (universal) or any context-specific primitive tag.
    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = tag == 0x04 || (0x80..=0x9F).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Read only length + value of OCTET STRING (tag already consumed). Use after read_tag() for [0] IMPLICIT etc.
    pub(crate) fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        Ok(self.take(length)?.to_vec())
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    /// Server-supplied text (DNs, diagnostics, URIs); invalid UTF-8 is replaced, not rejected.
    pub(crate) fn read_string_lossy(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if tag != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        self.read_integer_value()
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        Ok(self.take(1)?[0] != 0)
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i32> {
    if bytes.is_empty() {
        bail!("Integer with zero length");
    }
    // Tolerate one leading pad byte on 5-byte encodings of positive values.
    let bytes = if bytes.len() == 5 && bytes[0] == 0 && bytes[1] & 0x80 != 0 {
        &bytes[1..]
    } else {
        bytes
    };
    if bytes.len() > 4 {
        bail!("Integer too large: {} bytes", bytes.len());
    }
    let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in bytes {
        value = (value << 8) | byte as i32;
    }
    Ok(value)
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let bytes = length_octets(length);
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    /// Minimal two's-complement INTEGER content under an arbitrary tag.
    pub fn write_tagged_integer(&mut self, tag: u8, value: i32) {
        self.write_tag(tag);
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let (b, next) = (bytes[start], bytes[start + 1]);
            if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
                start += 1;
            } else {
                break;
            }
        }
        self.write_length(4 - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_integer(0x02, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged_integer(0x0A, value);
    }

    /// Primitive element with the given tag and raw content.
    pub fn write_tagged(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tagged(0x01, &[if value { 0xFF } else { 0x00 }]);
    }

    /// Reserve a length byte (no tag). Used for [APPLICATION n] IMPLICIT SEQUENCE.
    /// Call patch_implicit_sequence_length(pos) after writing the content.
    pub fn write_length_placeholder(&mut self) -> usize {
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch length at pos for content written after the placeholder.
    /// Supports short and long form.
    pub fn patch_implicit_sequence_length(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let bytes = length_octets(content_len);
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            self.buffer.splice(pos + 1..pos + 1, bytes);
        }
    }

    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        self.write_length_placeholder()
    }

    pub fn end_constructed(&mut self, pos: usize) {
        self.patch_implicit_sequence_length(pos);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, pos: usize) {
        self.end_constructed(pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn length_octets(mut len: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    bytes
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// [APPLICATION 25] IMPLICIT - intermediate response
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
pub const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;
/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// LDAPResult referral [3]
const LDAP_CONTEXT_REFERRAL: u8 = 0xA3;
const LDAP_CONTEXT_SASL_CREDS: u8 = 0x87;
const LDAP_CONTEXT_EXOP_REQ_NAME: u8 = 0x80;
const LDAP_CONTEXT_EXOP_REQ_VALUE: u8 = 0x81;
const LDAP_CONTEXT_EXOP_RESP_NAME: u8 = 0x8A;
const LDAP_CONTEXT_EXOP_RESP_VALUE: u8 = 0x8B;
const LDAP_CONTEXT_SIMPLE_AUTH: u8 = 0x80;
const LDAP_CONTEXT_NEW_SUPERIOR: u8 = 0x80;
const BER_SET: u8 = 0x31;

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut outer = BerReader::new(data);
    let mut reader = outer.expect(LDAP_MESSAGE_SEQUENCE_TAG)?;
    let message_id = reader.read_integer()?;
    let tag = reader
        .peek_tag()
        .ok_or_else(|| anyhow::anyhow!("LDAPMessage without protocolOp"))?;
    Ok((message_id, tag))
}

/// Parse the request controls of any LDAP message (used by test directory servers).
pub fn parse_message_controls(data: &[u8]) -> Result<Option<Vec<Control>>> {
    let mut outer = BerReader::new(data);
    let mut reader = outer.expect(LDAP_MESSAGE_SEQUENCE_TAG)?;
    let _message_id = reader.read_integer()?;
    let _op = reader.read_element()?;
    parse_optional_controls(&mut reader)
}

/// Parse one server-to-client LDAPMessage.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer
        .expect(LDAP_MESSAGE_SEQUENCE_TAG)
        .context("LDAPMessage envelope")?;

    let message_id = reader.read_integer()?;

    let (tag, mut body) = reader.read_element()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut body)?)
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => ProtocolOp::SearchResultReference(parse_uris(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_result_pdu(&mut body)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_result_pdu(&mut body)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_result_pdu(&mut body)?),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_result_pdu(&mut body)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(parse_result_pdu(&mut body)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_result_pdu(&mut body)?),
        LDAP_TAG_EXTENDED_RESPONSE => {
            ProtocolOp::ExtendedResponse(parse_extended_response(&mut body)?)
        }
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut body)?)
        }
        _ => ProtocolOp::Unrecognized { tag },
    };

    let controls = parse_optional_controls(&mut reader)?;

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn parse_optional_controls(reader: &mut BerReader) -> Result<Option<Vec<Control>>> {
    if reader.peek_tag() != Some(LDAP_CONTEXT_CONTROLS) {
        return Ok(None);
    }
    let mut content = reader.expect(LDAP_CONTEXT_CONTROLS)?;
    Ok(Some(parse_controls(&mut content)?))
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut ctrl = reader.read_sequence().context("Control")?;
        let ctype = ctrl.read_string()?;
        let critical = if ctrl.peek_tag() == Some(0x01) {
            ctrl.read_boolean()?
        } else {
            false
        };
        let value = if ctrl.peek_tag() == Some(0x04) {
            Some(ctrl.read_octet_string()?)
        } else {
            None
        };
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

/// LDAPResult ::= SEQUENCE { resultCode, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
fn parse_result_pdu(reader: &mut BerReader) -> Result<ResultPdu> {
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string_lossy()?;
    let diagnostic_message = reader.read_string_lossy()?;
    let referrals = if reader.peek_tag() == Some(LDAP_CONTEXT_REFERRAL) {
        let mut refs = reader.expect(LDAP_CONTEXT_REFERRAL)?;
        parse_uris(&mut refs)?
    } else {
        Vec::new()
    };
    Ok(ResultPdu {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_uris(reader: &mut BerReader) -> Result<Vec<String>> {
    let mut uris = Vec::new();
    while !reader.is_empty() {
        uris.push(reader.read_string_lossy().context("Referral URI")?);
    }
    Ok(uris)
}

fn parse_bind_response(reader: &mut BerReader) -> Result<BindResponse> {
    let result = parse_result_pdu(reader)?;
    let server_sasl_creds = if reader.peek_tag() == Some(LDAP_CONTEXT_SASL_CREDS) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

/// ExtendedResponse ::= [APPLICATION 24] SEQUENCE { COMPONENTS OF LDAPResult, responseName [10] OPTIONAL, responseValue [11] OPTIONAL }
fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let result = parse_result_pdu(reader)?;
    let response_name = if reader.peek_tag() == Some(LDAP_CONTEXT_EXOP_RESP_NAME) {
        Some(reader.read_string()?)
    } else {
        None
    };
    let response_value = if reader.peek_tag() == Some(LDAP_CONTEXT_EXOP_RESP_VALUE) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse> {
    let response_name = if reader.peek_tag() == Some(0x80) {
        Some(reader.read_string()?)
    } else {
        None
    };
    let response_value = if reader.peek_tag() == Some(0x81) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

/// SearchResultEntry ::= [APPLICATION 4] SEQUENCE { objectName, attributes PartialAttributeList }
fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let object_name = reader.read_octet_string().context("Entry objectName")?;
    let mut list = reader.read_sequence().context("Entry attribute list")?;
    let mut attributes = Vec::new();
    while !list.is_empty() {
        let mut attr = list.read_sequence()?;
        let attr_type = attr.read_octet_string()?;
        let mut vals = attr.expect(BER_SET)?;
        let mut attr_values = Vec::new();
        while !vals.is_empty() {
            attr_values.push(vals.read_octet_string()?);
        }
        attributes.push(EntryAttribute {
            attr_type,
            attr_values,
        });
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::UnbindRequest => writer.write_tagged(LDAP_TAG_UNBIND_REQUEST, &[]),
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::ModifyRequest(req) => encode_modify_request(&mut writer, req),
        ProtocolOp::AddRequest(req) => encode_add_request(&mut writer, req),
        ProtocolOp::DelRequest(req) => writer.write_tagged(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes()),
        ProtocolOp::ModifyDNRequest(req) => encode_modify_dn_request(&mut writer, req),
        ProtocolOp::CompareRequest(req) => encode_compare_request(&mut writer, req),
        ProtocolOp::AbandonRequest(id) => writer.write_tagged_integer(LDAP_TAG_ABANDON_REQUEST, *id),
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(&mut writer, req),
        ProtocolOp::BindResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_BIND_RESPONSE);
            encode_result_components(&mut writer, &resp.result);
            if let Some(ref creds) = resp.server_sasl_creds {
                writer.write_tagged(LDAP_CONTEXT_SASL_CREDS, creds);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultReference(uris) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                writer.write_string(uri);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultDone(res) => encode_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, res),
        ProtocolOp::ModifyResponse(res) => encode_result(&mut writer, LDAP_TAG_MODIFY_RESPONSE, res),
        ProtocolOp::AddResponse(res) => encode_result(&mut writer, LDAP_TAG_ADD_RESPONSE, res),
        ProtocolOp::DelResponse(res) => encode_result(&mut writer, LDAP_TAG_DEL_RESPONSE, res),
        ProtocolOp::ModifyDNResponse(res) => encode_result(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, res),
        ProtocolOp::CompareResponse(res) => encode_result(&mut writer, LDAP_TAG_COMPARE_RESPONSE, res),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
        ProtocolOp::IntermediateResponse(resp) => encode_intermediate_response(&mut writer, resp),
        ProtocolOp::Unrecognized { tag } => bail!("Cannot encode unrecognized operation 0x{:02X}", tag),
    }

    if let Some(ref controls) = message.controls {
        if !controls.is_empty() {
            encode_controls(&mut writer, controls);
        }
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    let pos = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
    for control in controls {
        let ctrl = writer.start_sequence();
        writer.write_string(&control.ctype);
        if control.critical {
            writer.write_boolean(true);
        }
        if let Some(ref value) = control.value {
            writer.write_octet_string(value);
        }
        writer.end_sequence(ctrl);
    }
    writer.end_constructed(pos);
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let pos = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    writer.write_tagged(LDAP_CONTEXT_SIMPLE_AUTH, &req.password);
    writer.end_constructed(pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    writer.write_enumerated(req.deref_aliases);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    req.filter.encode(writer);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_modify_request(writer: &mut BerWriter, req: &ModifyRequest) {
    let pos = writer.start_constructed(LDAP_TAG_MODIFY_REQUEST);
    writer.write_string(&req.object);
    let changes = writer.start_sequence();
    for change in &req.changes {
        let seq = writer.start_sequence();
        writer.write_enumerated(change.operation as i32);
        encode_attribute(writer, &change.modification.attr_type, &change.modification.attr_values);
        writer.end_sequence(seq);
    }
    writer.end_sequence(changes);
    writer.end_constructed(pos);
}

fn encode_add_request(writer: &mut BerWriter, req: &AddRequest) {
    let pos = writer.start_constructed(LDAP_TAG_ADD_REQUEST);
    writer.write_string(&req.entry);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        encode_attribute(writer, &attr.attr_type, &attr.attr_values);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn encode_modify_dn_request(writer: &mut BerWriter, req: &ModifyDNRequest) {
    let pos = writer.start_constructed(LDAP_TAG_MODIFY_DN_REQUEST);
    writer.write_string(&req.entry);
    writer.write_string(&req.newrdn);
    writer.write_boolean(req.delete_old_rdn);
    if let Some(ref superior) = req.new_superior {
        writer.write_tagged(LDAP_CONTEXT_NEW_SUPERIOR, superior.as_bytes());
    }
    writer.end_constructed(pos);
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn encode_compare_request(writer: &mut BerWriter, req: &CompareRequest) {
    let pos = writer.start_constructed(LDAP_TAG_COMPARE_REQUEST);
    writer.write_string(&req.entry);
    let ava = writer.start_sequence();
    writer.write_string(&req.attr);
    writer.write_octet_string(&req.assertion_value);
    writer.end_sequence(ava);
    writer.end_constructed(pos);
}

fn encode_extended_request(writer: &mut BerWriter, req: &ExtendedRequest) {
    let pos = writer.start_constructed(LDAP_TAG_EXTENDED_REQUEST);
    writer.write_tagged(LDAP_CONTEXT_EXOP_REQ_NAME, req.request_name.as_bytes());
    if let Some(ref value) = req.request_value {
        writer.write_tagged(LDAP_CONTEXT_EXOP_REQ_VALUE, value);
    }
    writer.end_constructed(pos);
}

fn encode_result_components(writer: &mut BerWriter, res: &ResultPdu) {
    writer.write_enumerated(res.result_code);
    writer.write_string(&res.matched_dn);
    writer.write_string(&res.diagnostic_message);
    if !res.referrals.is_empty() {
        let refs = writer.start_constructed(LDAP_CONTEXT_REFERRAL);
        for uri in &res.referrals {
            writer.write_string(uri);
        }
        writer.end_constructed(refs);
    }
}

fn encode_result(writer: &mut BerWriter, tag: u8, res: &ResultPdu) {
    let pos = writer.start_constructed(tag);
    encode_result_components(writer, res);
    writer.end_constructed(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_octet_string(&entry.object_name);
    let attrs = writer.start_sequence();
    for attr in &entry.attributes {
        let seq = writer.start_sequence();
        writer.write_octet_string(&attr.attr_type);
        let vals = writer.start_constructed(BER_SET);
        for value in &attr.attr_values {
            writer.write_octet_string(value);
        }
        writer.end_constructed(vals);
        writer.end_sequence(seq);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) {
    let pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
    encode_result_components(writer, &resp.result);
    if let Some(ref name) = resp.response_name {
        writer.write_tagged(LDAP_CONTEXT_EXOP_RESP_NAME, name.as_bytes());
    }
    if let Some(ref value) = resp.response_value {
        writer.write_tagged(LDAP_CONTEXT_EXOP_RESP_VALUE, value);
    }
    writer.end_constructed(pos);
}

fn encode_intermediate_response(writer: &mut BerWriter, resp: &IntermediateResponse) {
    let pos = writer.start_constructed(LDAP_TAG_INTERMEDIATE_RESPONSE);
    if let Some(ref name) = resp.response_name {
        writer.write_tagged(0x80, name.as_bytes());
    }
    if let Some(ref value) = resp.response_value {
        writer.write_tagged(0x81, value);
    }
    writer.end_constructed(pos);
}

fn encode_attribute(writer: &mut BerWriter, attr_type: &str, values: &[Vec<u8>]) {
    let seq = writer.start_sequence();
    writer.write_string(attr_type);
    let vals = writer.start_constructed(BER_SET);
    for value in values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(vals);
    writer.end_sequence(seq);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message_id: i32, op: ProtocolOp) -> Vec<u8> {
        encode_ldap_message(&LdapMessage::new(message_id, op)).unwrap()
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(1).unwrap(), SearchScope::SingleLevel);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert_eq!(SearchScope::try_from(3).unwrap(), SearchScope::Subordinate);
        assert!(SearchScope::try_from(4).is_err());
        assert!(SearchScope::try_from(255).is_err());
    }

    #[test]
    fn test_search_scope_from_str() {
        assert_eq!("base".parse::<SearchScope>().unwrap(), SearchScope::BaseObject);
        assert_eq!("ONE".parse::<SearchScope>().unwrap(), SearchScope::SingleLevel);
        assert_eq!("sub".parse::<SearchScope>().unwrap(), SearchScope::WholeSubtree);
        assert_eq!("children".parse::<SearchScope>().unwrap(), SearchScope::Subordinate);
        assert!("tree".parse::<SearchScope>().is_err());
    }

    #[test]
    fn test_ber_writer_integer_is_minimal() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x02, 0x01, 0x00]),
            (127, &[0x02, 0x01, 0x7F]),
            (128, &[0x02, 0x02, 0x00, 0x80]),
            (256, &[0x02, 0x02, 0x01, 0x00]),
            (-1, &[0x02, 0x01, 0xFF]),
            (-128, &[0x02, 0x01, 0x80]),
            (-129, &[0x02, 0x02, 0xFF, 0x7F]),
            (i32::MAX, &[0x02, 0x04, 0x7F, 0xFF, 0xFF, 0xFF]),
        ];
        for (value, expected) in cases {
            let mut writer = BerWriter::new();
            writer.write_integer(*value);
            assert_eq!(&writer.into_vec(), expected, "encoding of {}", value);
        }
    }

    #[test]
    fn test_ber_writer_boolean() {
        let mut writer = BerWriter::new();
        writer.write_boolean(true);
        writer.write_boolean(false);
        let result = writer.into_vec();
        assert_eq!(result, vec![0x01, 0x01, 0xFF, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_ber_writer_long_length() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        // 200 * 6 bytes = 1200 bytes of content, needs two length octets
        for _ in 0..200 {
            writer.write_string("test");
        }
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        assert_eq!(result[0], 0x30);
        assert_eq!(&result[1..4], &[0x82, 0x04, 0xB0]);
        assert_eq!(result.len(), 4 + 1200);
    }

    #[test]
    fn test_ber_reader_short_length() {
        let data = vec![0x04, 0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F]; // OCTET STRING "hello"
        let mut reader = BerReader::new(&data);
        let result = reader.read_octet_string().unwrap();
        assert_eq!(result, b"hello");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_ber_reader_integer() {
        let data = vec![0x02, 0x01, 0x2A]; // INTEGER 42
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_integer().unwrap(), 42);
    }

    #[test]
    fn test_ber_reader_negative_integer() {
        let data = vec![0x02, 0x01, 0xFF, 0x02, 0x02, 0xFF, 0x7F];
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_integer().unwrap(), -1);
        assert_eq!(reader.read_integer().unwrap(), -129);
    }

    #[test]
    fn test_ber_reader_boolean() {
        let data = vec![0x01, 0x01, 0xFF, 0x01, 0x01, 0x00];
        let mut reader = BerReader::new(&data);
        assert!(reader.read_boolean().unwrap());
        assert!(!reader.read_boolean().unwrap());
    }

    #[test]
    fn test_ber_reader_multibyte_enumerated() {
        // ENUMERATED 4096 (esyncRefreshRequired)
        let data = vec![0x0A, 0x02, 0x10, 0x00];
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_enumerated().unwrap(), 4096);
    }

    #[test]
    fn test_ber_reader_sequence_is_bounded() {
        // SEQUENCE { INTEGER 42 } followed by INTEGER 7
        let data = vec![0x30, 0x03, 0x02, 0x01, 0x2A, 0x02, 0x01, 0x07];
        let mut reader = BerReader::new(&data);
        let mut seq = reader.read_sequence().unwrap();
        assert_eq!(seq.read_integer().unwrap(), 42);
        assert!(seq.is_empty());
        assert_eq!(reader.read_integer().unwrap(), 7);
    }

    #[test]
    fn test_ber_reader_truncated() {
        let data = vec![0x04, 0x05, 0x68, 0x65];
        let mut reader = BerReader::new(&data);
        let err = reader.read_octet_string().unwrap_err();
        assert!(err.to_string().contains("BER truncated"));
    }

    #[test]
    fn test_encode_root_dse_search_request() {
        let filter = Filter::Present("objectClass".to_string());
        let req = SearchRequest::new("", SearchScope::BaseObject, filter);
        let encoded = encode(1, ProtocolOp::SearchRequest(req));
        let mut expected = vec![
            0x30, 0x25, 0x02, 0x01, 0x01, 0x63, 0x20, 0x04, 0x00, 0x0A, 0x01, 0x00, 0x0A, 0x01,
            0x00, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0x87, 0x0B,
        ];
        expected.extend_from_slice(b"objectClass");
        expected.extend_from_slice(&[0x30, 0x00]);
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_encode_abandon_and_unbind() {
        assert_eq!(
            encode(3, ProtocolOp::AbandonRequest(2)),
            vec![0x30, 0x06, 0x02, 0x01, 0x03, 0x50, 0x01, 0x02]
        );
        assert_eq!(
            encode(4, ProtocolOp::UnbindRequest),
            vec![0x30, 0x05, 0x02, 0x01, 0x04, 0x42, 0x00]
        );
    }

    #[test]
    fn test_encode_simple_bind_request() {
        let req = BindRequest {
            version: 3,
            name: "cn=admin".to_string(),
            password: b"secret".to_vec(),
        };
        let encoded = encode(1, ProtocolOp::BindRequest(req));
        let (message_id, tag) = parse_ldap_message_header(&encoded).unwrap();
        assert_eq!(message_id, 1);
        assert_eq!(tag, LDAP_TAG_BIND_REQUEST);
        assert!(encoded.ends_with(&[0x80, 0x06, b's', b'e', b'c', b'r', b'e', b't']));
    }

    #[test]
    fn test_parse_search_result_done_with_referrals() {
        let msg = vec![
            0x30, 0x22, // LDAPMessage
            0x02, 0x01, 0x02, // messageID 2
            0x65, 0x1D, // SearchResultDone
            0x0A, 0x01, 0x0A, // resultCode 10 (referral)
            0x04, 0x00, // matchedDN
            0x04, 0x00, // diagnosticMessage
            0xA3, 0x14, // referral [3]
            0x04, 0x12, b'l', b'd', b'a', b'p', b':', b'/', b'/', b'o', b't', b'h', b'e', b'r',
            b'/', b'o', b'=', b'e', b'x', b'1',
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 2);
        assert_eq!(parsed.kind(), MessageKind::SearchResult);
        match parsed.protocol_op {
            ProtocolOp::SearchResultDone(done) => {
                assert_eq!(done.result_code, 10);
                assert_eq!(done.referrals, vec!["ldap://other/o=ex1".to_string()]);
            }
            other => panic!("expected SearchResultDone, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_with_invalid_utf8_diagnostic() {
        let msg = vec![
            0x30, 0x0E, // LDAPMessage
            0x02, 0x01, 0x01, // messageID 1
            0x65, 0x09, // SearchResultDone
            0x0A, 0x01, 0x20, // resultCode 32
            0x04, 0x00, // matchedDN
            0x04, 0x02, 0xFF, 0xFE, // diagnosticMessage, not UTF-8
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        match parsed.protocol_op {
            ProtocolOp::SearchResultDone(done) => {
                assert_eq!(done.result_code, 32);
                assert!(done.matched_dn.is_empty());
                assert_eq!(done.diagnostic_message, "\u{FFFD}\u{FFFD}");
            }
            other => panic!("expected SearchResultDone, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_extended_response_keeps_empty_value() {
        let msg = vec![
            0x30, 0x26, 0x02, 0x01, 0x01, // messageID 1
            0x78, 0x21, // ExtendedResponse
            0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00, // success
            0x8A, 0x16, b'1', b'.', b'3', b'.', b'6', b'.', b'1', b'.', b'4', b'.', b'1', b'.',
            b'1', b'4', b'6', b'6', b'.', b'2', b'0', b'0', b'3', b'7', // responseName
            0x8B, 0x00, // responseValue, present but empty
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.kind(), MessageKind::ExtendedResponse);
        match parsed.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.response_name.as_deref(), Some("1.3.6.1.4.1.1466.20037"));
                assert_eq!(resp.response_value, Some(Vec::new()));
            }
            other => panic!("expected ExtendedResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_entry_with_binary_values() {
        let entry = SearchResultEntry {
            object_name: b"cn=bin,dc=example,dc=com".to_vec(),
            attributes: vec![
                EntryAttribute::new("cn", vec![b"bin".to_vec()]),
                EntryAttribute::new("jpegPhoto", vec![vec![0xFF, 0x00, 0xD8, 0x00], vec![]]),
            ],
        };
        let encoded = encode(5, ProtocolOp::SearchResultEntry(entry));
        let parsed = parse_ldap_message(&encoded).unwrap();
        assert_eq!(parsed.kind(), MessageKind::SearchEntry);
        match parsed.protocol_op {
            ProtocolOp::SearchResultEntry(e) => {
                assert_eq!(e.object_name, b"cn=bin,dc=example,dc=com");
                assert_eq!(e.attributes.len(), 2);
                assert_eq!(e.attributes[1].attr_type, b"jpegPhoto");
                assert_eq!(e.attributes[1].attr_values[0], vec![0xFF, 0x00, 0xD8, 0x00]);
                assert!(e.attributes[1].attr_values[1].is_empty());
            }
            other => panic!("expected SearchResultEntry, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_with_controls() {
        let mut message = LdapMessage::new(
            7,
            ProtocolOp::SearchResultDone(ResultPdu::new(0, "")),
        );
        message.controls = Some(vec![
            Control::new("1.2.840.113556.1.4.319", false, Some(vec![0x30, 0x05, 0x02, 0x01, 0x00, 0x04, 0x00])),
            Control::new("1.2.3.4", true, None),
        ]);
        let encoded = encode_ldap_message(&message).unwrap();
        let parsed = parse_ldap_message(&encoded).unwrap();
        let controls = parsed.controls.unwrap();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].ctype, "1.2.840.113556.1.4.319");
        assert!(!controls[0].critical);
        assert_eq!(controls[0].value.as_deref(), Some(&[0x30, 0x05, 0x02, 0x01, 0x00, 0x04, 0x00][..]));
        assert!(controls[1].critical);
        assert!(controls[1].value.is_none());
        assert_eq!(parse_message_controls(&encoded).unwrap().unwrap(), controls);
    }

    #[test]
    fn test_parse_bind_response_with_sasl_creds() {
        let resp = BindResponse {
            result: ResultPdu::new(14, ""),
            server_sasl_creds: Some(b"challenge".to_vec()),
        };
        let parsed = parse_ldap_message(&encode(1, ProtocolOp::BindResponse(resp))).unwrap();
        assert_eq!(parsed.kind(), MessageKind::SingleShotDone);
        match parsed.protocol_op {
            ProtocolOp::BindResponse(b) => {
                assert_eq!(b.result.result_code, 14);
                assert_eq!(b.server_sasl_creds.as_deref(), Some(&b"challenge"[..]));
            }
            other => panic!("expected BindResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_and_intermediate_are_other() {
        let reference = parse_ldap_message(&encode(
            2,
            ProtocolOp::SearchResultReference(vec!["ldap://a/dc=x".into(), "ldap://b/dc=x".into()]),
        ))
        .unwrap();
        assert_eq!(reference.kind(), MessageKind::Other);
        match reference.protocol_op {
            ProtocolOp::SearchResultReference(uris) => assert_eq!(uris.len(), 2),
            other => panic!("expected reference, got {:?}", other),
        }

        let intermediate = parse_ldap_message(&encode(
            2,
            ProtocolOp::IntermediateResponse(IntermediateResponse {
                response_name: Some("1.3.6.1.4.1.4203.1.9.1.4".into()),
                response_value: Some(vec![0x00, 0x01]),
            }),
        ))
        .unwrap();
        assert_eq!(intermediate.kind(), MessageKind::Other);
        assert!(!intermediate.is_terminal());
    }

    #[test]
    fn test_parse_unknown_application_tag() {
        // [APPLICATION 30] is not a defined response
        let msg = vec![0x30, 0x05, 0x02, 0x01, 0x09, 0x7E, 0x00];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert!(matches!(parsed.protocol_op, ProtocolOp::Unrecognized { tag: 0x7E }));
        assert_eq!(parsed.kind(), MessageKind::Other);
    }

    #[test]
    fn test_parse_rejects_non_sequence() {
        let msg = vec![0x04, 0x03, 0x02, 0x01, 0x01];
        assert!(parse_ldap_message(&msg).is_err());
    }
}
