//! Request-control state carried across calls, and decoders for the
//! response controls the result decoder understands.

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{BerReader, BerWriter, Control};
use crate::result_code::{err2string, DECODING_ERROR, PARAM_ERROR};
use anyhow::bail;
use tracing::debug;

/// RFC 2696 simple paged results
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
/// RFC 2891 server side sort request
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
/// draft-behera-ldap-password-policy request and response
pub const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";

/// Paging state reported by the server with a search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResults {
    pub estimated_count: i32,
    pub cookie: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyError {
    PasswordExpired,
    AccountLocked,
    ChangeAfterReset,
    PasswordModNotAllowed,
    MustSupplyOldPassword,
    InsufficientPasswordQuality,
    PasswordTooShort,
    PasswordTooYoung,
    PasswordInHistory,
    Unknown(i32),
}

impl PasswordPolicyError {
    fn from_code(code: i32) -> Self {
        match code {
            0 => Self::PasswordExpired,
            1 => Self::AccountLocked,
            2 => Self::ChangeAfterReset,
            3 => Self::PasswordModNotAllowed,
            4 => Self::MustSupplyOldPassword,
            5 => Self::InsufficientPasswordQuality,
            6 => Self::PasswordTooShort,
            7 => Self::PasswordTooYoung,
            8 => Self::PasswordInHistory,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PasswordExpired => "Password expired",
            Self::AccountLocked => "Account locked",
            Self::ChangeAfterReset => "Password must be changed",
            Self::PasswordModNotAllowed => "Policy prevents password modification",
            Self::MustSupplyOldPassword => "Policy requires old password in order to change password",
            Self::InsufficientPasswordQuality => "Password fails quality checks",
            Self::PasswordTooShort => "Password is too short for policy",
            Self::PasswordTooYoung => "Password has been changed too recently",
            Self::PasswordInHistory => "New password is in list of old passwords",
            Self::Unknown(_) => "Unknown error",
        }
    }
}

/// Password policy response. `expire` and `grace` are -1 when not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub expire: i32,
    pub grace: i32,
    pub error: Option<PasswordPolicyError>,
    pub message: String,
}

/// Structured extras decoded from recognized response controls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseControls {
    pub paged: Option<PagedResults>,
    pub password_policy: Option<PasswordPolicy>,
}

/// Server and client control lists plus paging state, shared by successive
/// requests (for example every page of one paged search).
#[derive(Debug, Clone, Default)]
pub struct ControlsContext {
    server: Vec<Control>,
    client: Vec<Control>,
    page_size: i32,
    cookie: Vec<u8>,
    estimated_count: Option<i32>,
}

impl ControlsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control. Paged results take a decimal page size as value,
    /// server side sort takes a key list like `"-uidNumber cn:caseIgnoreOrderingMatch"`.
    pub fn add_control(
        &mut self,
        oid: &str,
        value: Option<&[u8]>,
        critical: bool,
        client: bool,
    ) -> Result<()> {
        if self.list(client).iter().any(|c| c.ctype == oid) {
            return Err(param_error(format!("OID {} is already registered", oid)));
        }
        let control = match oid {
            PAGED_RESULTS_OID => {
                let value = value.ok_or_else(|| {
                    param_error("Paged results control requires a page size value")
                })?;
                let page_size = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| param_error("Page size must be a positive integer"))?;
                self.page_size = page_size;
                self.cookie.clear();
                self.estimated_count = None;
                Control::new(oid, critical, Some(encode_paged_value(page_size, &self.cookie)))
            }
            SORT_REQUEST_OID => {
                let value = value.ok_or_else(|| param_error("Sort control requires a key list value"))?;
                let keys = std::str::from_utf8(value)
                    .map_err(|_| param_error("Sort key list is not valid UTF-8"))?;
                Control::new(oid, critical, Some(encode_sort_keys(keys)?))
            }
            _ => Control::new(oid, critical, value.map(|v| v.to_vec())),
        };
        self.list_mut(client).push(control);
        Ok(())
    }

    pub fn remove_control(&mut self, oid: &str, client: bool) -> Result<()> {
        let list = self.list_mut(client);
        if list.is_empty() {
            return Err(param_error("No controls are set"));
        }
        let pos = list
            .iter()
            .position(|c| c.ctype == oid)
            .ok_or_else(|| param_error(format!("Specified control {} is not found", oid)))?;
        list.remove(pos);
        if oid == PAGED_RESULTS_OID && !client {
            self.page_size = 0;
            self.cookie.clear();
            self.estimated_count = None;
        }
        Ok(())
    }

    /// OIDs in registration order.
    pub fn list_controls(&self, client: bool) -> Vec<&str> {
        self.list(client).iter().map(|c| c.ctype.as_str()).collect()
    }

    pub fn server_controls(&self) -> &[Control] {
        &self.server
    }

    pub fn client_controls(&self) -> &[Control] {
        &self.client
    }

    /// Cookie from the last paged response; `None` while empty.
    pub fn paging_cookie(&self) -> Option<&[u8]> {
        if self.cookie.is_empty() {
            None
        } else {
            Some(&self.cookie)
        }
    }

    pub fn page_size(&self) -> Option<i32> {
        (self.page_size > 0).then_some(self.page_size)
    }

    pub fn estimated_count(&self) -> Option<i32> {
        self.estimated_count
    }

    /// True after a paged response that carried a non-empty cookie.
    pub fn has_more_pages(&self) -> bool {
        self.page_size > 0 && !self.cookie.is_empty()
    }

    /// Update state from the controls attached to a terminal message.
    pub fn apply_response_controls(&mut self, controls: &[Control]) -> Result<ResponseControls> {
        let mut extras = ResponseControls::default();
        for control in controls {
            match control.ctype.as_str() {
                PAGED_RESULTS_OID => {
                    let paged = parse_paged_value(control.value.as_deref().unwrap_or_default())
                        .map_err(|e| decoding_error("paged results response", e))?;
                    self.cookie = paged.cookie.clone();
                    self.estimated_count = Some(paged.estimated_count);
                    self.refresh_paged_request();
                    debug!(
                        "Paged results: estimate {}, cookie {} bytes",
                        paged.estimated_count,
                        paged.cookie.len()
                    );
                    extras.paged = Some(paged);
                }
                PASSWORD_POLICY_OID => {
                    let policy = parse_password_policy(control.value.as_deref().unwrap_or_default())
                        .map_err(|e| decoding_error("password policy response", e))?;
                    extras.password_policy = Some(policy);
                }
                other => debug!("Ignoring response control {}", other),
            }
        }
        Ok(extras)
    }

    /// A search finished without a paged-results response control: the
    /// server has nothing more to page, so drop the stored cookie.
    pub fn end_paging(&mut self) {
        if self.page_size <= 0 || self.cookie.is_empty() {
            return;
        }
        debug!("Search done without paged results response; clearing cookie");
        self.cookie.clear();
        self.refresh_paged_request();
    }

    /// Re-encode the paged request control with the page size and latest cookie.
    fn refresh_paged_request(&mut self) {
        if self.page_size <= 0 {
            return;
        }
        let value = encode_paged_value(self.page_size, &self.cookie);
        if let Some(ctrl) = self.server.iter_mut().find(|c| c.ctype == PAGED_RESULTS_OID) {
            ctrl.value = Some(value);
        }
    }

    fn list(&self, client: bool) -> &Vec<Control> {
        if client {
            &self.client
        } else {
            &self.server
        }
    }

    fn list_mut(&mut self, client: bool) -> &mut Vec<Control> {
        if client {
            &mut self.client
        } else {
            &mut self.server
        }
    }
}

fn param_error(text: impl Into<String>) -> LdapError {
    LdapError::protocol_with_text(PARAM_ERROR, text)
}

fn decoding_error(what: &str, err: anyhow::Error) -> LdapError {
    LdapError::protocol_with_text(
        DECODING_ERROR,
        format!("{}: {}: {}", err2string(DECODING_ERROR), what, err),
    )
}

/// realSearchControlValue ::= SEQUENCE { size INTEGER, cookie OCTET STRING }
pub(crate) fn encode_paged_value(size: i32, cookie: &[u8]) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(size);
    writer.write_octet_string(cookie);
    writer.end_sequence(seq);
    writer.into_vec()
}

pub(crate) fn parse_paged_value(value: &[u8]) -> anyhow::Result<PagedResults> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let estimated_count = seq.read_integer()?;
    let cookie = seq.read_octet_string()?;
    Ok(PagedResults {
        estimated_count,
        cookie,
    })
}

/// PasswordPolicyResponseValue ::= SEQUENCE {
///     warning [0] CHOICE { timeBeforeExpiration [0] INTEGER, graceAuthNsRemaining [1] INTEGER } OPTIONAL,
///     error   [1] ENUMERATED OPTIONAL }
fn parse_password_policy(value: &[u8]) -> anyhow::Result<PasswordPolicy> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let mut expire = -1;
    let mut grace = -1;
    let mut error = None;
    while let Some(tag) = seq.peek_tag() {
        match tag {
            0xA0 => {
                let mut warning = seq.expect(0xA0)?;
                let choice = warning.read_tag()?;
                let value = warning.read_integer_value()?;
                match choice {
                    0x80 => expire = value,
                    0x81 => grace = value,
                    other => bail!("Unknown password policy warning 0x{:02X}", other),
                }
            }
            0x81 => {
                seq.read_tag()?;
                error = Some(PasswordPolicyError::from_code(seq.read_integer_value()?));
            }
            other => bail!("Unexpected password policy element 0x{:02X}", other),
        }
    }
    let message = error.map(|e| e.as_str()).unwrap_or("No error").to_string();
    Ok(PasswordPolicy {
        expire,
        grace,
        error,
        message,
    })
}

/// SortKeyList ::= SEQUENCE OF SEQUENCE { attributeType, orderingRule [0] OPTIONAL, reverseOrder [1] BOOLEAN DEFAULT FALSE }
fn encode_sort_keys(keys: &str) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let list = writer.start_sequence();
    let mut count = 0;
    for key in keys.split_whitespace() {
        let (reverse, key) = match key.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, key),
        };
        let (attr, rule) = match key.split_once(':') {
            Some((attr, rule)) => (attr, Some(rule)),
            None => (key, None),
        };
        if attr.is_empty() || rule == Some("") {
            return Err(param_error(format!("Invalid sort key: {}", key)));
        }
        let seq = writer.start_sequence();
        writer.write_string(attr);
        if let Some(rule) = rule {
            writer.write_tagged(0x80, rule.as_bytes());
        }
        if reverse {
            writer.write_tagged(0x81, &[0xFF]);
        }
        writer.end_sequence(seq);
        count += 1;
    }
    if count == 0 {
        return Err(param_error("Sort key list is empty"));
    }
    writer.end_sequence(list);
    Ok(writer.into_vec())
}
