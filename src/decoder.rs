//! Result decoder: turns batches of parsed protocol messages into ordered
//! [`Entry`] values followed by one terminal [`LdapResult`].

use crate::controls::{ControlsContext, ResponseControls};
use crate::error::{LdapError, Result};
use crate::ldap_protocol::{op_name, Control, LdapMessage, MessageKind, ProtocolOp, ResultPdu, SearchResultEntry};
use crate::result_code;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Which outstanding operation a fetch is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    /// Any pending operation (and unsolicited notifications).
    Any,
    Id(i32),
}

impl MessageId {
    pub fn matches(self, message_id: i32) -> bool {
        match self {
            MessageId::Any => true,
            MessageId::Id(id) => id == message_id,
        }
    }
}

impl From<i32> for MessageId {
    fn from(id: i32) -> Self {
        MessageId::Id(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// One message at a time.
    One,
    /// Every message of one operation, once its terminal message is in.
    All,
    /// Whatever is already buffered, up to the first terminal message.
    Received,
}

/// Non-positive, NaN or unrepresentable seconds mean "block indefinitely".
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Supplier of protocol message batches, usually a [`crate::session::Session`].
#[async_trait]
pub trait MessageSource: Send {
    /// `Ok(None)` when the deadline passed with nothing to deliver.
    async fn next_batch(
        &mut self,
        msgid: MessageId,
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<LdapMessage>>>;
}

/// One directory object from a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    order: Vec<String>,
    attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Attribute names in arrival order, starting with the synthetic `"dn"`.
    pub fn attribute_order(&self) -> &[String] {
        &self.order
    }

    /// Attribute names in arrival order, without `"dn"`.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.order[1..].iter().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attrs.get(name).map(Vec::as_slice)
    }

    /// First value of `name` when it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)?
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// `(name, values)` pairs in arrival order, `"dn"` first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.order
            .iter()
            .filter_map(|name| self.attrs.get(name).map(|v| (name.as_str(), v.as_slice())))
    }

    pub fn attributes(&self) -> &HashMap<String, Vec<Vec<u8>>> {
        &self.attrs
    }
}

/// Terminal outcome of one LDAP operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub message_id: i32,
    pub result_code: i32,
    pub matched_dn: Option<String>,
    pub diagnostic_message: Option<String>,
    /// Text rendering of `result_code`.
    pub message: String,
    pub referrals: Vec<String>,
    /// Controls as received, recognized or not.
    pub controls: Vec<Control>,
    pub response_controls: Option<ResponseControls>,
    pub extended_oid: Option<String>,
    pub extended_data: Option<Vec<u8>>,
    pub server_sasl_creds: Option<Vec<u8>>,
}

impl LdapResult {
    pub fn is_success(&self) -> bool {
        self.result_code == result_code::SUCCESS
    }

    /// Turn a non-success result into [`LdapError::Protocol`].
    pub fn success(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let text = self
            .diagnostic_message
            .clone()
            .unwrap_or_else(|| self.message.clone());
        Err(LdapError::protocol_with_text(self.result_code, text))
    }

    /// Outcome of a compare operation.
    pub fn compare_outcome(self) -> Result<bool> {
        match self.result_code {
            result_code::COMPARE_TRUE => Ok(true),
            result_code::COMPARE_FALSE => Ok(false),
            _ => self.success().map(|_| false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultItem {
    Entry(Entry),
    Done(LdapResult),
}

impl ResultItem {
    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            ResultItem::Entry(e) => Some(e),
            ResultItem::Done(_) => None,
        }
    }

    pub fn as_result(&self) -> Option<&LdapResult> {
        match self {
            ResultItem::Done(r) => Some(r),
            ResultItem::Entry(_) => None,
        }
    }
}

/// Retrieve the next batch for `msgid` and decode it.
///
/// Entries come back in delivery order; a terminal result, if the batch
/// reached one, is always last.
pub async fn fetch_results<S>(
    source: &mut S,
    msgid: MessageId,
    mode: WaitMode,
    timeout: Option<Duration>,
    controls: Option<&mut ControlsContext>,
) -> Result<Vec<ResultItem>>
where
    S: MessageSource + ?Sized,
{
    match source.next_batch(msgid, mode, timeout).await? {
        Some(batch) => decode_batch(batch, controls),
        None => Err(LdapError::Timeout),
    }
}

/// Decode one batch. Nothing partial is returned on error.
pub fn decode_batch(
    batch: Vec<LdapMessage>,
    mut controls: Option<&mut ControlsContext>,
) -> Result<Vec<ResultItem>> {
    let mut items = Vec::new();
    items.try_reserve_exact(batch.len())?;
    let total = batch.len();

    for (index, message) in batch.into_iter().enumerate() {
        match message.kind() {
            MessageKind::SearchEntry => {
                items.push(ResultItem::Entry(decode_entry(message)?));
            }
            MessageKind::SearchResult | MessageKind::SingleShotDone | MessageKind::ExtendedResponse => {
                items.push(ResultItem::Done(decode_result(message, controls.as_deref_mut())?));
                if index + 1 < total {
                    debug!("Dropping {} messages after terminal result", total - index - 1);
                }
                break;
            }
            MessageKind::Other => {
                debug!(
                    "Skipping {} for message {}",
                    op_name(&message.protocol_op),
                    message.message_id
                );
            }
        }
    }
    Ok(items)
}

fn decode_entry(message: LdapMessage) -> Result<Entry> {
    let message_id = message.message_id;
    let SearchResultEntry {
        object_name,
        attributes,
    } = match message.protocol_op {
        ProtocolOp::SearchResultEntry(entry) => entry,
        other => {
            return Err(LdapError::MalformedMessage(format!(
                "{} is not a search entry",
                op_name(&other)
            )))
        }
    };

    let dn = String::from_utf8(object_name).map_err(|_| {
        LdapError::MalformedMessage(format!("entry DN in message {} is not UTF-8", message_id))
    })?;

    let mut order = Vec::new();
    order.try_reserve_exact(attributes.len() + 1)?;
    let mut attrs = HashMap::new();
    attrs.try_reserve(attributes.len() + 1)?;

    let mut dn_value = Vec::new();
    dn_value.try_reserve_exact(1)?;
    dn_value.push(dn.as_bytes().to_vec());
    order.push("dn".to_string());
    attrs.insert("dn".to_string(), dn_value);

    for attribute in attributes {
        // An empty type marks the end of the attribute list.
        if attribute.attr_type.is_empty() {
            break;
        }
        let name = String::from_utf8(attribute.attr_type).map_err(|_| {
            LdapError::MalformedMessage(format!(
                "attribute type in entry {} is not UTF-8",
                dn
            ))
        })?;
        // "dn" is reserved for the entry name.
        if name.eq_ignore_ascii_case("dn") {
            debug!("Ignoring server attribute {:?} in entry {}", name, dn);
            continue;
        }
        match attrs.get_mut(&name) {
            Some(values) => {
                // Repeated type: keep the first position, append values.
                values.try_reserve_exact(attribute.attr_values.len())?;
                values.extend(attribute.attr_values);
            }
            None => {
                order.push(name.clone());
                attrs.insert(name, attribute.attr_values);
            }
        }
    }

    Ok(Entry {
        dn,
        order,
        attrs,
    })
}

fn decode_result(message: LdapMessage, controls: Option<&mut ControlsContext>) -> Result<LdapResult> {
    let LdapMessage {
        message_id,
        protocol_op,
        controls: received,
    } = message;
    let search_done = matches!(protocol_op, ProtocolOp::SearchResultDone(_));

    let (pdu, extended, server_sasl_creds) = match protocol_op {
        ProtocolOp::BindResponse(resp) => (resp.result, None, resp.server_sasl_creds),
        ProtocolOp::SearchResultDone(pdu)
        | ProtocolOp::ModifyResponse(pdu)
        | ProtocolOp::AddResponse(pdu)
        | ProtocolOp::DelResponse(pdu)
        | ProtocolOp::ModifyDNResponse(pdu)
        | ProtocolOp::CompareResponse(pdu) => (pdu, None, None),
        ProtocolOp::ExtendedResponse(resp) => {
            (resp.result, Some((resp.response_name, resp.response_value)), None)
        }
        other => {
            return Err(LdapError::MalformedMessage(format!(
                "{} is not a terminal response",
                op_name(&other)
            )))
        }
    };
    let ResultPdu {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    } = pdu;

    let received = received.unwrap_or_default();
    let response_controls = match controls {
        Some(ctx) => {
            let extras = ctx.apply_response_controls(&received)?;
            if search_done && extras.paged.is_none() {
                ctx.end_paging();
            }
            (!received.is_empty()).then_some(extras)
        }
        None => None,
    };
    let (extended_oid, extended_data) = extended.unwrap_or((None, None));

    debug!(
        "Result for message {}: {} ({} referrals)",
        message_id,
        result_code,
        referrals.len()
    );

    Ok(LdapResult {
        message_id,
        result_code,
        matched_dn: non_empty(matched_dn),
        diagnostic_message: non_empty(diagnostic_message),
        message: result_code::err2string(result_code).to_string(),
        referrals,
        controls: received,
        response_controls,
        extended_oid,
        extended_data,
        server_sasl_creds,
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{encode_paged_value, PAGED_RESULTS_OID, PASSWORD_POLICY_OID};
    use crate::ldap_protocol::{BindResponse, EntryAttribute, ExtendedResponse, IntermediateResponse};
    use std::collections::VecDeque;

    fn entry_message(id: i32, dn: &str, attrs: Vec<EntryAttribute>) -> LdapMessage {
        LdapMessage::new(
            id,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: dn.as_bytes().to_vec(),
                attributes: attrs,
            }),
        )
    }

    fn done_message(id: i32, code: i32, diag: &str) -> LdapMessage {
        LdapMessage::new(id, ProtocolOp::SearchResultDone(ResultPdu::new(code, diag)))
    }

    /// Hands out scripted batches; `None` stands for an elapsed deadline.
    struct ScriptedSource {
        batches: VecDeque<Option<Vec<LdapMessage>>>,
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn next_batch(
            &mut self,
            _msgid: MessageId,
            _mode: WaitMode,
            _timeout: Option<Duration>,
        ) -> Result<Option<Vec<LdapMessage>>> {
            self.batches
                .pop_front()
                .ok_or_else(|| LdapError::protocol(result_code::NO_RESULTS_RETURNED))
        }
    }

    #[test]
    fn test_three_entries_then_done() {
        let batch = vec![
            entry_message(2, "cn=a,dc=x", vec![EntryAttribute::new("cn", vec![b"a".to_vec()])]),
            entry_message(2, "cn=b,dc=x", vec![EntryAttribute::new("cn", vec![b"b".to_vec()])]),
            entry_message(2, "cn=c,dc=x", vec![EntryAttribute::new("cn", vec![b"c".to_vec()])]),
            done_message(2, 0, ""),
        ];
        let items = decode_batch(batch, None).unwrap();
        assert_eq!(items.len(), 4);
        let dns: Vec<&str> = items.iter().filter_map(|i| i.as_entry()).map(|e| e.dn()).collect();
        assert_eq!(dns, vec!["cn=a,dc=x", "cn=b,dc=x", "cn=c,dc=x"]);
        let result = items[3].as_result().unwrap();
        assert_eq!(result.result_code, 0);
        assert_eq!(result.message, "Success");
        assert_eq!(result.referrals, Vec::<String>::new());
        assert!(result.diagnostic_message.is_none());
    }

    #[test]
    fn test_no_such_object_result() {
        let items = decode_batch(vec![done_message(3, 32, "entry does not exist")], None).unwrap();
        assert_eq!(items.len(), 1);
        let result = items[0].as_result().unwrap();
        assert_eq!(result.result_code, 32);
        assert_eq!(result.diagnostic_message.as_deref(), Some("entry does not exist"));
        assert_eq!(result.message, "No such object");
        let err = result.clone().success().unwrap_err();
        assert_eq!(err.code(), 32);
        assert_eq!(err.to_string(), "entry does not exist (32)");
    }

    #[test]
    fn test_attribute_order_and_binary_values() {
        let photo = vec![0x00, 0x01, 0x00, 0xFF, 0x00];
        let batch = vec![entry_message(
            1,
            "uid=jdoe,dc=x",
            vec![
                EntryAttribute::new("uid", vec![b"jdoe".to_vec()]),
                EntryAttribute::new("objectClass", vec![b"top".to_vec(), b"person".to_vec()]),
                EntryAttribute::new("jpegPhoto", vec![photo.clone()]),
            ],
        )];
        let items = decode_batch(batch, None).unwrap();
        let entry = items[0].as_entry().unwrap();
        assert_eq!(entry.attribute_order(), &["dn", "uid", "objectClass", "jpegPhoto"]);
        assert_eq!(
            entry.attribute_names().collect::<Vec<_>>(),
            vec!["uid", "objectClass", "jpegPhoto"]
        );
        assert_eq!(entry.get("dn").unwrap(), &[b"uid=jdoe,dc=x".to_vec()]);
        assert_eq!(entry.get("jpegPhoto").unwrap()[0], photo);
        assert_eq!(entry.get("jpegPhoto").unwrap()[0].len(), 5);
        assert_eq!(entry.get("objectClass").unwrap().len(), 2);
        assert_eq!(entry.get_str("uid"), Some("jdoe"));

        let keys: Vec<&str> = entry.attributes().keys().map(String::as_str).filter(|k| *k != "dn").collect();
        assert_eq!(keys.len(), entry.attribute_names().count());
        for key in keys {
            assert!(entry.attribute_names().any(|n| n == key));
        }
        let pairs: Vec<&str> = entry.iter().map(|(n, _)| n).collect();
        assert_eq!(pairs, vec!["dn", "uid", "objectClass", "jpegPhoto"]);
    }

    #[test]
    fn test_repeated_attribute_merges_values() {
        let batch = vec![entry_message(
            1,
            "cn=x",
            vec![
                EntryAttribute::new("mail", vec![b"a@x".to_vec()]),
                EntryAttribute::new("cn", vec![b"x".to_vec()]),
                EntryAttribute::new("mail", vec![b"b@x".to_vec()]),
            ],
        )];
        let items = decode_batch(batch, None).unwrap();
        let entry = items[0].as_entry().unwrap();
        assert_eq!(entry.attribute_order(), &["dn", "mail", "cn"]);
        assert_eq!(entry.get("mail").unwrap(), &[b"a@x".to_vec(), b"b@x".to_vec()]);
    }

    #[test]
    fn test_server_dn_attribute_does_not_join_entry_name() {
        let batch = vec![entry_message(
            1,
            "cn=x,o=ex",
            vec![
                EntryAttribute::new("dn", vec![b"cn=spoof".to_vec()]),
                EntryAttribute::new("cn", vec![b"x".to_vec()]),
                EntryAttribute::new("DN", vec![b"cn=other".to_vec()]),
            ],
        )];
        let items = decode_batch(batch, None).unwrap();
        let entry = items[0].as_entry().unwrap();
        assert_eq!(entry.attribute_order(), &["dn", "cn"]);
        assert_eq!(entry.get("dn").unwrap(), &[b"cn=x,o=ex".to_vec()]);
    }

    #[test]
    fn test_empty_attribute_type_ends_list() {
        let batch = vec![entry_message(
            1,
            "cn=x",
            vec![
                EntryAttribute::new("cn", vec![b"x".to_vec()]),
                EntryAttribute::new("", vec![]),
                EntryAttribute::new("sn", vec![b"y".to_vec()]),
            ],
        )];
        let items = decode_batch(batch, None).unwrap();
        let entry = items[0].as_entry().unwrap();
        assert_eq!(entry.attribute_order(), &["dn", "cn"]);
        assert!(entry.get("sn").is_none());
    }

    #[test]
    fn test_invalid_dn_is_malformed_and_nothing_leaks() {
        let mut bad = entry_message(1, "", vec![]);
        if let ProtocolOp::SearchResultEntry(ref mut e) = bad.protocol_op {
            e.object_name = vec![0xC3, 0x28];
        }
        let batch = vec![entry_message(1, "cn=ok", vec![]), bad, done_message(1, 0, "")];
        let err = decode_batch(batch, None).unwrap_err();
        assert!(matches!(err, LdapError::MalformedMessage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_other_messages_skipped() {
        let batch = vec![
            LdapMessage::new(4, ProtocolOp::SearchResultReference(vec!["ldap://h/dc=y".into()])),
            entry_message(4, "cn=a", vec![]),
            LdapMessage::new(
                4,
                ProtocolOp::IntermediateResponse(IntermediateResponse {
                    response_name: None,
                    response_value: None,
                }),
            ),
            done_message(4, 0, ""),
        ];
        let items = decode_batch(batch, None).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].as_entry().is_some());
        assert!(items[1].as_result().is_some());
    }

    #[test]
    fn test_terminal_stops_decoding() {
        let batch = vec![done_message(5, 0, ""), entry_message(6, "cn=late", vec![])];
        let items = decode_batch(batch, None).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_embedded_code_is_authoritative() {
        let msg = LdapMessage::new(
            1,
            ProtocolOp::BindResponse(BindResponse {
                result: ResultPdu::new(49, ""),
                server_sasl_creds: None,
            }),
        );
        let items = decode_batch(vec![msg], None).unwrap();
        let result = items[0].as_result().unwrap();
        assert_eq!(result.result_code, 49);
        assert_eq!(result.message, "Invalid credentials");
    }

    #[test]
    fn test_extended_response_with_empty_data() {
        let msg = LdapMessage::new(
            1,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: ResultPdu::new(0, ""),
                response_name: Some("1.3.6.1.4.1.1466.20037".into()),
                response_value: Some(Vec::new()),
            }),
        );
        let items = decode_batch(vec![msg], None).unwrap();
        let result = items[0].as_result().unwrap();
        assert_eq!(result.extended_oid.as_deref(), Some("1.3.6.1.4.1.1466.20037"));
        assert_eq!(result.extended_data, Some(Vec::new()));
    }

    #[test]
    fn test_non_extended_result_has_no_extended_fields() {
        let items = decode_batch(vec![done_message(1, 0, "")], None).unwrap();
        let result = items[0].as_result().unwrap();
        assert!(result.extended_oid.is_none());
        assert!(result.extended_data.is_none());
    }

    #[test]
    fn test_response_controls_need_context() {
        let mut msg = done_message(2, 0, "");
        msg.controls = Some(vec![
            Control::new(PAGED_RESULTS_OID, false, Some(encode_paged_value(42, b"next"))),
            Control::new(PASSWORD_POLICY_OID, false, Some(vec![0x30, 0x05, 0xA0, 0x03, 0x81, 0x01, 0x01])),
        ]);

        let items = decode_batch(vec![msg.clone()], None).unwrap();
        let result = items[0].as_result().unwrap();
        assert!(result.response_controls.is_none());
        assert_eq!(result.controls.len(), 2);

        let mut ctx = ControlsContext::new();
        ctx.add_control(PAGED_RESULTS_OID, Some(&b"10"[..]), false, false).unwrap();
        let items = decode_batch(vec![msg], Some(&mut ctx)).unwrap();
        let extras = items[0].as_result().unwrap().response_controls.clone().unwrap();
        assert_eq!(extras.paged.unwrap().estimated_count, 42);
        assert_eq!(extras.password_policy.unwrap().grace, 1);
        assert_eq!(ctx.paging_cookie(), Some(&b"next"[..]));
    }

    #[test]
    fn test_search_done_without_paged_control_ends_paging() {
        let mut ctx = ControlsContext::new();
        ctx.add_control(PAGED_RESULTS_OID, Some(&b"2"[..]), false, false).unwrap();
        let mut first = done_message(1, 0, "");
        first.controls = Some(vec![Control::new(
            PAGED_RESULTS_OID,
            false,
            Some(encode_paged_value(0, b"c1")),
        )]);
        decode_batch(vec![first], Some(&mut ctx)).unwrap();
        assert!(ctx.has_more_pages());

        let items = decode_batch(vec![done_message(2, 0, "")], Some(&mut ctx)).unwrap();
        assert!(items[0].as_result().unwrap().response_controls.is_none());
        assert!(!ctx.has_more_pages());
        assert_eq!(ctx.paging_cookie(), None);
    }

    #[test]
    fn test_compare_outcome() {
        let mut msg = done_message(1, result_code::COMPARE_TRUE, "");
        msg.protocol_op = ProtocolOp::CompareResponse(ResultPdu::new(result_code::COMPARE_TRUE, ""));
        let items = decode_batch(vec![msg], None).unwrap();
        let result = items[0].as_result().unwrap().clone();
        assert!(result.compare_outcome().unwrap());
    }

    #[test]
    fn test_timeout_from_secs() {
        assert_eq!(timeout_from_secs(0.0), None);
        assert_eq!(timeout_from_secs(-1.0), None);
        assert_eq!(timeout_from_secs(f64::NAN), None);
        assert_eq!(timeout_from_secs(f64::INFINITY), None);
        assert_eq!(timeout_from_secs(1.5), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_fetch_results_timeout() {
        let mut source = ScriptedSource {
            batches: VecDeque::from(vec![None]),
        };
        let err = fetch_results(&mut source, MessageId::Any, WaitMode::All, Some(Duration::from_millis(10)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Timeout));
    }

    #[tokio::test]
    async fn test_fetch_results_one_at_a_time() {
        let mut source = ScriptedSource {
            batches: VecDeque::from(vec![
                Some(vec![entry_message(7, "cn=a", vec![])]),
                Some(vec![done_message(7, 0, "")]),
            ]),
        };
        let first = fetch_results(&mut source, MessageId::Id(7), WaitMode::One, None, None)
            .await
            .unwrap();
        assert!(first[0].as_entry().is_some());
        let second = fetch_results(&mut source, MessageId::Id(7), WaitMode::One, None, None)
            .await
            .unwrap();
        assert!(second[0].as_result().is_some());
    }

    #[tokio::test]
    async fn test_fetch_results_propagates_source_error() {
        let mut source = ScriptedSource {
            batches: VecDeque::new(),
        };
        let err = fetch_results(&mut source, MessageId::Any, WaitMode::All, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), result_code::NO_RESULTS_RETURNED);
    }
}
