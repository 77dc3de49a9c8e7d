//! The connection core
//!
//! One connection owns one socket. Many callers issue interleaved operations; each outstanding
//! operation is keyed by its message ID in a pending table holding a bounded per-waiter channel.
//! A dedicated reader thread decodes inbound frames and routes them by ID; outbound frames are
//! serialised by the writer mutex (the "writer turn"). Callers block on their own channel, so a
//! response can never reach the wrong caller.

use crate::attrs::AttributeMap;
use crate::ber::{self, Framing};
use crate::error::{Error, LdapError};
use crate::filter::Filter;
use crate::filter_text;
use crate::ldap::{
    oid, AuthenticationChoice, BindRequest, Change, Control, DerefAliases, ExtendedRequest,
    IntermediateResponse, LdapDN, LdapMessage, LdapResult, LdapString, MessageID, ModDnRequest,
    CompareRequest, ProtocolOp, ResultCode, SaslCredentials, SearchRequest, SearchResultEntry,
    SearchScope,
};
use crate::filter::{Attribute, AttributeValueAssertion};
use crate::sasl::{External, SaslMechanism};
use crate::schema::{AttributeType, MatchingRule, ObjectClass, SchemaRegistry};
use crate::ser;
use crate::transport::{LdapUri, ReadHalf, Scheme, Transport, WriteHalf};
use asn1_rs::FromBer;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What to do with an explicitly empty value list in a high-level modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyListPolicy {
    /// Drop the element silently
    Ignore,
    /// Drop the element and log a warning
    Warn,
    /// Fail the call before any I/O
    Error,
    /// Send the element as given (a replace with no values deletes the attribute)
    Forward,
}

/// Immutable per-connection defaults; new connections inherit a value of this type and callers
/// override per call where the API allows it.
#[derive(Debug, Clone)]
pub struct DefaultsConfig {
    pub connect_timeout: Option<Duration>,
    pub operation_timeout: Option<Duration>,
    /// High-water mark for buffered search entries; 0 means rendezvous delivery (the reader
    /// stalls until the consumer takes each item)
    pub search_buffer: usize,
    pub empty_list_policy: EmptyListPolicy,
    /// Negotiate StartTLS during connection establishment on `ldap://` URIs
    pub starttls: bool,
    /// Probe the root DSE after connecting (supported controls, naming contexts)
    pub probe_root_dse: bool,
    /// Skip the planner's pre-fetch and deduplication for high-level modifications
    pub strict_modify: bool,
    /// Default scope for relative searches on directory objects
    pub relative_scope: SearchScope,
    /// Upper bound on a single inbound message
    pub max_message_size: usize,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            connect_timeout: Some(Duration::from_secs(30)),
            operation_timeout: None,
            search_buffer: 64,
            empty_list_policy: EmptyListPolicy::Warn,
            starttls: false,
            probe_root_dse: true,
            strict_modify: false,
            relative_scope: SearchScope::WholeSubtree,
            max_message_size: 8 * 1024 * 1024,
            tls_config: None,
        }
    }
}

impl DefaultsConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_search_buffer(mut self, high_water: usize) -> Self {
        self.search_buffer = high_water;
        self
    }

    pub fn with_empty_list_policy(mut self, policy: EmptyListPolicy) -> Self {
        self.empty_list_policy = policy;
        self
    }

    pub fn with_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    pub fn with_probe_root_dse(mut self, probe: bool) -> Self {
        self.probe_root_dse = probe;
        self
    }

    pub fn with_strict_modify(mut self, strict: bool) -> Self {
        self.strict_modify = strict;
        self
    }

    pub fn with_relative_scope(mut self, scope: SearchScope) -> Self {
        self.relative_scope = scope;
        self
    }

    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Opening,
    Open,
    Bound,
    Closing,
    Closed,
}

/// Owned terminal result of an operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referral: Vec<String>,
    pub controls: Vec<Control<'static>>,
}

impl OperationResult {
    fn from_wire(result: &LdapResult<'_>, controls: Option<Vec<Control<'static>>>) -> Self {
        OperationResult {
            result_code: result.result_code,
            matched_dn: result.matched_dn.0.to_string(),
            diagnostic_message: result.diagnostic_message.0.to_string(),
            referral: result
                .referral
                .as_ref()
                .map(|urls| urls.iter().map(|u| u.0.to_string()).collect())
                .unwrap_or_default(),
            controls: controls.unwrap_or_default(),
        }
    }

    /// Turn a server failure into the corresponding error.
    pub fn check(self) -> Result<OperationResult, Error> {
        match self.result_code {
            ResultCode::Success | ResultCode::CompareTrue | ResultCode::CompareFalse => Ok(self),
            ResultCode::Referral => Err(Error::Referral(self.referral)),
            code => Err(Error::OperationFailed {
                result_code: code,
                diagnostic_message: self.diagnostic_message,
                matched_dn: self.matched_dn,
            }),
        }
    }
}

/// Result of an extended operation, including any interim responses.
#[derive(Debug, Clone)]
pub struct ExtendedResult {
    pub result: OperationResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
    pub intermediates: Vec<IntermediateResponse<'static>>,
}

/// Capabilities probed from the root DSE.
#[derive(Debug, Clone, Default)]
pub struct RootDse {
    /// `None` when the server did not disclose its supported controls
    pub supported_controls: Option<HashSet<String>>,
    pub supported_extensions: Vec<String>,
    pub naming_contexts: Vec<String>,
    pub subschema_subentry: Option<String>,
}

enum SinkItem {
    Msg(LdapMessage<'static>),
    Failed(Error),
}

struct Waiter {
    tx: SyncSender<SinkItem>,
}

struct Pending {
    next_id: u32,
    table: HashMap<u32, Waiter>,
}

/// Outstanding-operation cap; far below the ID space, it bounds the scan in `allocate_id`.
const MAX_OUTSTANDING: usize = 1 << 16;

/// Buffered interim items for single-response operations (extended ops may emit several
/// intermediate responses before the terminal one).
const SINGLE_CAPACITY: usize = 8;

struct ConnInner {
    host: String,
    config: DefaultsConfig,
    writer: Mutex<Option<WriteHalf>>,
    pending: Mutex<Pending>,
    state: Mutex<ConnState>,
    bind_in_flight: AtomicBool,
    unsolicited: Mutex<Vec<crate::ldap::ExtendedResponse<'static>>>,
    root_dse: Mutex<Option<RootDse>>,
    schema: Mutex<Arc<SchemaRegistry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to an LDAP connection; cheap to clone, safe to share across threads.
#[derive(Clone)]
pub struct LdapConnection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("host", &self.inner.host)
            .field("state", &self.state())
            .finish()
    }
}

impl LdapConnection {
    /// Connect to `uri` with default settings.
    pub fn connect(uri: &str) -> Result<Self, Error> {
        LdapConnection::connect_with(uri, DefaultsConfig::default())
    }

    /// Connect with explicit defaults. StartTLS (when configured) is negotiated before the
    /// multiplexer starts; the root DSE is probed opportunistically afterwards.
    pub fn connect_with(uri: &str, config: DefaultsConfig) -> Result<Self, Error> {
        let parsed = LdapUri::from_str(uri)?;
        let mut transport = Transport::connect(&parsed, config.connect_timeout, config.tls_config.clone())?;
        let mut next_id = 1;
        if config.starttls && parsed.scheme == Scheme::Ldap {
            transport = negotiate_starttls(transport, &parsed.host, &config)?;
            next_id = 2;
        }
        let (read_half, write_half) = transport.split().map_err(Error::Connection)?;
        let inner = Arc::new(ConnInner {
            host: parsed.host.clone(),
            config,
            writer: Mutex::new(Some(write_half)),
            pending: Mutex::new(Pending {
                next_id,
                table: HashMap::new(),
            }),
            state: Mutex::new(ConnState::Open),
            bind_in_flight: AtomicBool::new(false),
            unsolicited: Mutex::new(Vec::new()),
            root_dse: Mutex::new(None),
            schema: Mutex::new(Arc::new(SchemaRegistry::core())),
        });
        {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("ldap-reader-{}", parsed.host))
                .spawn(move || reader_loop(inner, read_half))
                .map_err(Error::Connection)?;
        }
        let conn = LdapConnection { inner };
        if conn.inner.config.probe_root_dse {
            conn.probe_root_dse();
        }
        log::debug!("connected to {}", uri);
        Ok(conn)
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn state(&self) -> ConnState {
        *lock(&self.inner.state)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), ConnState::Open | ConnState::Bound)
    }

    pub fn config(&self) -> &DefaultsConfig {
        &self.inner.config
    }

    /// The connection's schema registry (the built-in core until [`fetch_schema`] runs).
    ///
    /// [`fetch_schema`]: LdapConnection::fetch_schema
    pub fn schema(&self) -> Arc<SchemaRegistry> {
        lock(&self.inner.schema).clone()
    }

    /// Probed root DSE capabilities, if the probe has run and succeeded.
    pub fn root_dse(&self) -> Option<RootDse> {
        lock(&self.inner.root_dse).clone()
    }

    /// Unsolicited notifications received so far (notice-of-disconnection is handled
    /// internally and additionally surfaces here).
    pub fn take_unsolicited(&self) -> Vec<crate::ldap::ExtendedResponse<'static>> {
        std::mem::take(&mut *lock(&self.inner.unsolicited))
    }

    // ---- bind ----

    /// Simple bind (RFC 4513 section 5.1.3).
    pub fn simple_bind(&self, dn: &str, password: &str) -> Result<OperationResult, Error> {
        self.begin_bind()?;
        let outcome = self.run_bind(BindRequest {
            version: 3,
            name: LdapDN(Cow::Borrowed(dn)),
            authentication: AuthenticationChoice::Simple(Cow::Borrowed(password.as_bytes())),
        });
        self.finish_bind(&outcome);
        outcome.and_then(OperationResult::check)
    }

    /// SASL bind loop driving the external mechanism provider.
    pub fn sasl_bind(&self, mechanism: &mut dyn SaslMechanism) -> Result<OperationResult, Error> {
        self.begin_bind()?;
        let outcome = self.run_sasl_bind(mechanism);
        self.finish_bind(&outcome);
        outcome.and_then(OperationResult::check)
    }

    /// SASL EXTERNAL bind, the conventional default for `ldapi://` connections.
    pub fn sasl_external_bind(&self) -> Result<OperationResult, Error> {
        self.sasl_bind(&mut External::new())
    }

    fn begin_bind(&self) -> Result<(), Error> {
        if self
            .inner
            .bind_in_flight
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            return Err(Error::BindInProgress);
        }
        Ok(())
    }

    fn finish_bind(&self, outcome: &Result<OperationResult, Error>) {
        self.inner.bind_in_flight.store(false, AtomicOrdering::SeqCst);
        if let Ok(result) = outcome {
            if result.result_code == ResultCode::Success {
                let mut state = lock(&self.inner.state);
                if *state == ConnState::Open {
                    *state = ConnState::Bound;
                }
            }
        }
    }

    fn run_bind(&self, request: BindRequest<'_>) -> Result<OperationResult, Error> {
        let (id, rx) = self.begin(ProtocolOp::BindRequest(request), None, SINGLE_CAPACITY)?;
        let (msg, _) = self.await_single(id, &rx, self.inner.config.operation_timeout)?;
        match msg.protocol_op {
            ProtocolOp::BindResponse(resp) => {
                Ok(OperationResult::from_wire(&resp.result, msg.controls))
            }
            _ => Err(Error::Protocol(LdapError::InvalidMessageType)),
        }
    }

    fn run_sasl_bind(&self, mechanism: &mut dyn SaslMechanism) -> Result<OperationResult, Error> {
        let mut response = mechanism.start(&self.inner.host)?;
        loop {
            let request = BindRequest {
                version: 3,
                name: LdapDN(Cow::Borrowed("")),
                authentication: AuthenticationChoice::Sasl(SaslCredentials {
                    mechanism: LdapString(Cow::Borrowed(mechanism.name())),
                    credentials: response.take().map(Cow::Owned),
                }),
            };
            let (id, rx) = self.begin(ProtocolOp::BindRequest(request), None, SINGLE_CAPACITY)?;
            let (msg, _) = self.await_single(id, &rx, self.inner.config.operation_timeout)?;
            let resp = match msg.protocol_op {
                ProtocolOp::BindResponse(resp) => resp,
                _ => return Err(Error::Protocol(LdapError::InvalidMessageType)),
            };
            match resp.result.result_code {
                ResultCode::SaslBindInProgress => {
                    let challenge = resp.server_sasl_creds.as_deref().unwrap_or(&[]);
                    response = Some(mechanism.step(challenge)?);
                }
                ResultCode::Success => {
                    mechanism.complete()?;
                    return Ok(OperationResult::from_wire(&resp.result, msg.controls));
                }
                _ => return Ok(OperationResult::from_wire(&resp.result, msg.controls)),
            }
        }
    }

    // ---- search ----

    /// Begin a search; the returned stream yields entries and references until the terminal
    /// done message. The filter string is parsed in unified syntax.
    pub fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<SearchStream, Error> {
        self.search_with(base, scope, filter, attrs, SearchOptions::default())
    }

    pub fn search_with(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
        options: SearchOptions,
    ) -> Result<SearchStream, Error> {
        let filter = filter_text::parse_filter(filter)?;
        self.search_ast(base, scope, filter, attrs, options)
    }

    pub fn search_ast(
        &self,
        base: &str,
        scope: SearchScope,
        filter: Filter<'_>,
        attrs: &[&str],
        options: SearchOptions,
    ) -> Result<SearchStream, Error> {
        let request = SearchRequest {
            base_object: LdapDN(Cow::Borrowed(base)),
            scope,
            deref_aliases: options.deref_aliases,
            size_limit: options.size_limit,
            time_limit: options.time_limit,
            types_only: options.types_only,
            filter,
            attributes: attrs
                .iter()
                .map(|a| LdapString(Cow::Borrowed(*a)))
                .collect(),
        };
        let capacity = options
            .buffer
            .unwrap_or(self.inner.config.search_buffer);
        let controls = if options.controls.is_empty() {
            None
        } else {
            Some(options.controls.clone())
        };
        let (id, rx) = self.begin(ProtocolOp::SearchRequest(request), controls, capacity)?;
        let deadline = options
            .timeout
            .or(self.inner.config.operation_timeout)
            .map(|t| Instant::now() + t);
        Ok(SearchStream {
            conn: self.clone(),
            id,
            rx,
            deadline,
            outcome: None,
            terminated: false,
            aborted: false,
        })
    }

    /// Run a search to completion, collecting all entries.
    pub fn search_collect(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<(Vec<SearchResultEntry<'static>>, OperationResult), Error> {
        let mut stream = self.search(base, scope, filter, attrs)?;
        let mut entries = Vec::new();
        while let Some(item) = stream.next()? {
            match item {
                SearchItem::Entry(entry, _) => entries.push(entry),
                SearchItem::Reference(urls, _) => {
                    log::debug!("ignoring continuation reference {:?}", urls)
                }
            }
        }
        let outcome = stream.take_outcome()?.check()?;
        Ok((entries, outcome))
    }

    // ---- updates ----

    /// Low-level modify: send the atomic modification list as given.
    pub fn modify(
        &self,
        dn: &str,
        changes: Vec<Change<'static>>,
        controls: Vec<Control<'static>>,
    ) -> Result<OperationResult, Error> {
        if changes.is_empty() {
            return Err(Error::InvalidValue("empty modification list".to_string()));
        }
        let op = ProtocolOp::ModifyRequest(crate::ldap::ModifyRequest {
            object: LdapDN(Cow::Borrowed(dn)),
            changes,
        });
        self.run_checked(op, controls)
    }

    pub fn add(
        &self,
        dn: &str,
        attributes: Vec<Attribute<'static>>,
        controls: Vec<Control<'static>>,
    ) -> Result<OperationResult, Error> {
        let op = ProtocolOp::AddRequest(crate::ldap::AddRequest {
            entry: LdapDN(Cow::Borrowed(dn)),
            attributes,
        });
        self.run_checked(op, controls)
    }

    pub fn delete(&self, dn: &str, controls: Vec<Control<'static>>) -> Result<OperationResult, Error> {
        let op = ProtocolOp::DelRequest(LdapDN(Cow::Borrowed(dn)));
        self.run_checked(op, controls)
    }

    pub fn mod_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<OperationResult, Error> {
        let op = ProtocolOp::ModDnRequest(ModDnRequest {
            entry: LdapDN(Cow::Borrowed(dn)),
            newrdn: crate::ldap::RelativeLdapDN(Cow::Borrowed(new_rdn)),
            deleteoldrdn: delete_old_rdn,
            newsuperior: new_superior.map(|s| LdapDN(Cow::Borrowed(s))),
        });
        self.run_checked(op, Vec::new())
    }

    /// Compare an attribute value server-side; true on `compareTrue`.
    pub fn compare(&self, dn: &str, attr: &str, value: &[u8]) -> Result<bool, Error> {
        let op = ProtocolOp::CompareRequest(CompareRequest {
            entry: LdapDN(Cow::Borrowed(dn)),
            ava: AttributeValueAssertion {
                attribute_desc: LdapString(Cow::Borrowed(attr)),
                assertion_value: Cow::Borrowed(value),
            },
        });
        let result = self.run_checked(op, Vec::new())?;
        Ok(result.result_code == ResultCode::CompareTrue)
    }

    /// Extended operation (RFC 4511 section 4.12).
    pub fn extended(&self, request_name: &str, value: Option<&[u8]>) -> Result<ExtendedResult, Error> {
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: crate::ldap::LdapOID(Cow::Borrowed(request_name)),
            request_value: value.map(Cow::Borrowed),
        });
        let (id, rx) = self.begin(op, None, SINGLE_CAPACITY)?;
        let (msg, intermediates) =
            self.await_single(id, &rx, self.inner.config.operation_timeout)?;
        match msg.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => Ok(ExtendedResult {
                result: OperationResult::from_wire(&resp.result, msg.controls).check()?,
                response_name: resp.response_name.map(|n| n.0.to_string()),
                response_value: resp.response_value.map(|v| v.into_owned()),
                intermediates,
            }),
            _ => Err(Error::Protocol(LdapError::InvalidMessageType)),
        }
    }

    /// "Who am I?" (RFC 4532): the server's view of the bound authorization identity.
    pub fn whoami(&self) -> Result<String, Error> {
        let result = self.extended(oid::WHO_AM_I, None)?;
        let authz_id = result.response_value.unwrap_or_default();
        String::from_utf8(authz_id)
            .map_err(|_| Error::Protocol(LdapError::InvalidString))
    }

    /// Abandon an outstanding operation. The waiter fails locally with [`Error::Abandoned`];
    /// abandoning a completed operation is a no-op.
    pub fn abandon(&self, id: MessageID) -> Result<(), Error> {
        self.abandon_id(id.0)
    }

    pub(crate) fn abandon_id(&self, id: u32) -> Result<(), Error> {
        let waiter = lock(&self.inner.pending).table.remove(&id);
        let waiter = match waiter {
            Some(waiter) => waiter,
            None => return Ok(()),
        };
        let abandon_id = {
            let mut pending = lock(&self.inner.pending);
            allocate_id(&mut pending)?
        };
        let msg = LdapMessage {
            message_id: MessageID(abandon_id),
            protocol_op: ProtocolOp::AbandonRequest(MessageID(id)),
            controls: None,
        };
        log::debug!("> abandon {} (as msg {})", id, abandon_id);
        let outcome = self.write_frame(&ser::encode_message(&msg));
        let _ = waiter.tx.try_send(SinkItem::Failed(Error::Abandoned));
        outcome
    }

    /// Orderly teardown: send `unbindRequest` (no response exists) and close the socket. All
    /// pending operations fail with [`Error::ConnectionClosed`].
    pub fn unbind(&self) -> Result<(), Error> {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, ConnState::Closing | ConnState::Closed) {
                return Ok(());
            }
            *state = ConnState::Closing;
        }
        let id = {
            let mut pending = lock(&self.inner.pending);
            allocate_id(&mut pending)?
        };
        let msg = LdapMessage {
            message_id: MessageID(id),
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        };
        let _ = self.write_frame(&ser::encode_message(&msg));
        let mut writer = lock(&self.inner.writer);
        if let Some(w) = writer.as_ref() {
            w.shutdown();
        }
        *writer = None;
        Ok(())
    }

    // ---- capability probing and schema ----

    fn probe_root_dse(&self) {
        let attrs = [
            "supportedControl",
            "supportedExtension",
            "namingContexts",
            "subschemaSubentry",
        ];
        let result = self.search_collect("", SearchScope::BaseObject, "(objectClass=*)", &attrs);
        match result {
            Ok((entries, _)) => {
                let mut dse = RootDse::default();
                if let Some(entry) = entries.first() {
                    for attr in &entry.attributes {
                        let values = || {
                            attr.attr_vals
                                .iter()
                                .filter_map(|v| std::str::from_utf8(&v.0).ok())
                                .map(str::to_string)
                        };
                        let name = attr.attr_type.0.as_ref();
                        if name.eq_ignore_ascii_case("supportedControl") {
                            dse.supported_controls = Some(values().collect());
                        } else if name.eq_ignore_ascii_case("supportedExtension") {
                            dse.supported_extensions = values().collect();
                        } else if name.eq_ignore_ascii_case("namingContexts") {
                            dse.naming_contexts = values().collect();
                        } else if name.eq_ignore_ascii_case("subschemaSubentry") {
                            dse.subschema_subentry = values().next();
                        }
                    }
                }
                *lock(&self.inner.root_dse) = Some(dse);
            }
            Err(e) => log::debug!("root DSE probe failed: {}", e),
        }
    }

    /// Read the subschema subentry and register its elements into this connection's registry.
    pub fn fetch_schema(&self) -> Result<Arc<SchemaRegistry>, Error> {
        let subentry = self
            .root_dse()
            .and_then(|dse| dse.subschema_subentry)
            .unwrap_or_else(|| "cn=Subschema".to_string());
        let attrs = ["attributeTypes", "objectClasses", "matchingRules", "ldapSyntaxes"];
        let (entries, _) =
            self.search_collect(&subentry, SearchScope::BaseObject, "(objectClass=*)", &attrs)?;
        let mut registry = (*self.schema()).clone();
        for entry in &entries {
            for attr in &entry.attributes {
                let name = attr.attr_type.0.as_ref();
                for value in &attr.attr_vals {
                    let Ok(text) = std::str::from_utf8(&value.0) else {
                        continue;
                    };
                    let outcome = if name.eq_ignore_ascii_case("attributeTypes") {
                        AttributeType::from_str(text).and_then(|at| registry.register_attribute_type(at))
                    } else if name.eq_ignore_ascii_case("objectClasses") {
                        ObjectClass::from_str(text).and_then(|oc| registry.register_object_class(oc))
                    } else if name.eq_ignore_ascii_case("matchingRules") {
                        MatchingRule::from_str(text).and_then(|mr| registry.register_matching_rule(mr))
                    } else {
                        Ok(())
                    };
                    if let Err(e) = outcome {
                        log::warn!("skipping schema element: {}", e);
                    }
                }
            }
        }
        let registry = Arc::new(registry);
        *lock(&self.inner.schema) = registry.clone();
        Ok(registry)
    }

    // ---- plumbing ----

    /// Critical-control pre-flight: a critical control the probed server does not advertise
    /// fails locally, before any bytes are sent.
    fn check_controls(&self, controls: &[Control<'_>]) -> Result<(), Error> {
        let dse = lock(&self.inner.root_dse);
        let supported = match dse.as_ref().and_then(|d| d.supported_controls.as_ref()) {
            Some(supported) => supported,
            None => return Ok(()),
        };
        for control in controls {
            if control.criticality && !supported.contains(control.control_type.0.as_ref()) {
                return Err(Error::UnsupportedControl(
                    control.control_type.0.to_string(),
                ));
            }
        }
        Ok(())
    }

    fn run_checked(
        &self,
        op: ProtocolOp<'_>,
        controls: Vec<Control<'static>>,
    ) -> Result<OperationResult, Error> {
        let controls = if controls.is_empty() { None } else { Some(controls) };
        let (id, rx) = self.begin(op, controls, SINGLE_CAPACITY)?;
        let (msg, _) = self.await_single(id, &rx, self.inner.config.operation_timeout)?;
        match msg.protocol_op.result() {
            Some(result) => OperationResult::from_wire(result, msg.controls.clone()).check(),
            None => Err(Error::Protocol(LdapError::InvalidMessageType)),
        }
    }

    /// Register a waiter, serialise the request and put it on the wire.
    fn begin<'a>(
        &self,
        op: ProtocolOp<'a>,
        controls: Option<Vec<Control<'a>>>,
        capacity: usize,
    ) -> Result<(u32, Receiver<SinkItem>), Error> {
        match self.state() {
            ConnState::Closing | ConnState::Closed => return Err(Error::ConnectionClosed),
            _ => {}
        }
        if self.inner.bind_in_flight.load(AtomicOrdering::SeqCst) && !allowed_during_bind(&op) {
            return Err(Error::BindInProgress);
        }
        if let Some(controls) = &controls {
            self.check_controls(controls)?;
        }
        let (tx, rx) = mpsc::sync_channel(capacity);
        let id = {
            let mut pending = lock(&self.inner.pending);
            let id = allocate_id(&mut pending)?;
            pending.table.insert(id, Waiter { tx });
            id
        };
        let msg = LdapMessage {
            message_id: MessageID(id),
            protocol_op: op,
            controls,
        };
        let frame = ser::encode_message(&msg);
        log::trace!("> msg {} {} ({} bytes)", id, msg.protocol_op.tag(), frame.len());
        if let Err(e) = self.write_frame(&frame) {
            lock(&self.inner.pending).table.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    fn write_frame(&self, frame: &[u8]) -> Result<(), Error> {
        let mut guard = lock(&self.inner.writer);
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        match writer.write_all(frame).and_then(|_| writer.flush()) {
            Ok(()) => Ok(()),
            Err(e) => {
                // a dead socket is fatal; wake the reader so it fails the other waiters
                writer.shutdown();
                Err(Error::Connection(e))
            }
        }
    }

    /// Wait for the terminal response, collecting interim intermediate responses. Deadline
    /// expiry abandons the operation; no server response is needed to complete the timeout.
    fn await_single(
        &self,
        id: u32,
        rx: &Receiver<SinkItem>,
        timeout: Option<Duration>,
    ) -> Result<(LdapMessage<'static>, Vec<IntermediateResponse<'static>>), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut intermediates = Vec::new();
        loop {
            let item = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let _ = self.abandon_id(id);
                        return Err(Error::Timeout);
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(item) => item,
                        Err(RecvTimeoutError::Timeout) => {
                            let _ = self.abandon_id(id);
                            return Err(Error::Timeout);
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(Error::ConnectionClosed)
                        }
                    }
                }
                None => match rx.recv() {
                    Ok(item) => item,
                    Err(_) => return Err(Error::ConnectionClosed),
                },
            };
            match item {
                SinkItem::Msg(msg) => match msg.protocol_op {
                    ProtocolOp::IntermediateResponse(interim) => intermediates.push(interim),
                    _ => return Ok((msg, intermediates)),
                },
                SinkItem::Failed(e) => return Err(e),
            }
        }
    }
}

fn allowed_during_bind(op: &ProtocolOp<'_>) -> bool {
    match op {
        ProtocolOp::BindRequest(_)
        | ProtocolOp::UnbindRequest
        | ProtocolOp::AbandonRequest(_) => true,
        ProtocolOp::ExtendedRequest(req) => req.request_name.0 == oid::START_TLS,
        _ => false,
    }
}

fn allocate_id(pending: &mut Pending) -> Result<u32, Error> {
    if pending.table.len() >= MAX_OUTSTANDING {
        return Err(Error::TooManyOutstanding);
    }
    let start = if pending.next_id == 0 { 1 } else { pending.next_id };
    let mut candidate = start;
    loop {
        if candidate == 0 {
            candidate = 1;
        }
        if !pending.table.contains_key(&candidate) {
            pending.next_id = candidate.wrapping_add(1);
            return Ok(candidate);
        }
        candidate = candidate.wrapping_add(1);
        if candidate == start {
            return Err(Error::TooManyOutstanding);
        }
    }
}

/// The StartTLS extended exchange, performed synchronously before the reader thread exists.
fn negotiate_starttls(
    mut transport: Transport,
    host: &str,
    config: &DefaultsConfig,
) -> Result<Transport, Error> {
    let msg = LdapMessage {
        message_id: MessageID(1),
        protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: crate::ldap::LdapOID(Cow::Borrowed(oid::START_TLS)),
            request_value: None,
        }),
        controls: None,
    };
    transport
        .write_all(&ser::encode_message(&msg))
        .map_err(Error::Connection)?;
    let mut buf = Vec::with_capacity(256);
    let mut tmp = [0u8; 4096];
    let frame_end = loop {
        match ber::frame_len(&buf).map_err(Error::Protocol)? {
            Framing::Ready(n) => break n,
            Framing::Needs(_) => {}
        }
        let n = transport.read_some(&mut tmp).map_err(Error::Connection)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    let (_, reply) = LdapMessage::from_ber(&buf[..frame_end])?;
    match &reply.protocol_op {
        ProtocolOp::ExtendedResponse(resp) => {
            if resp.result.result_code != ResultCode::Success {
                return Err(Error::OperationFailed {
                    result_code: resp.result.result_code,
                    diagnostic_message: resp.result.diagnostic_message.0.to_string(),
                    matched_dn: resp.result.matched_dn.0.to_string(),
                });
            }
        }
        _ => return Err(Error::Protocol(LdapError::InvalidMessageType)),
    }
    log::debug!("StartTLS accepted, wrapping transport");
    transport.start_tls(host, config.tls_config.clone())
}

// ---- reader side ----

fn reader_loop(inner: Arc<ConnInner>, mut rd: ReadHalf) {
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut tmp = [0u8; 16 * 1024];
    let cause = loop {
        match ber::frame_len(&buf) {
            Ok(Framing::Ready(n)) => {
                if n > inner.config.max_message_size {
                    break Error::Protocol(LdapError::InvalidLength);
                }
                let frame: Vec<u8> = buf.drain(..n).collect();
                match LdapMessage::from_ber(&frame) {
                    Ok((rem, msg)) => {
                        if !rem.is_empty() {
                            log::warn!("{} trailing bytes inside message frame", rem.len());
                        }
                        log::trace!(
                            "< msg {} {} ({} bytes)",
                            msg.message_id.0,
                            msg.protocol_op.tag(),
                            frame.len()
                        );
                        if dispatch(&inner, msg.to_static()) {
                            break Error::ConnectionClosed;
                        }
                    }
                    Err(e) => break e.into(),
                }
                continue;
            }
            Ok(Framing::Needs(_)) => {}
            Err(e) => break Error::Protocol(e),
        }
        if buf.len() >= inner.config.max_message_size {
            break Error::Protocol(LdapError::InvalidLength);
        }
        match rd.read(&mut tmp) {
            Ok(0) => break Error::ConnectionClosed,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(e) => break Error::Connection(e),
        }
    };
    close_connection(&inner, cause);
}

/// Route one inbound message. Returns true when the message mandates closing the connection
/// (server-initiated disconnection).
fn dispatch(inner: &Arc<ConnInner>, msg: LdapMessage<'static>) -> bool {
    if msg.is_unsolicited() {
        return handle_unsolicited(inner, msg);
    }
    let id = msg.message_id.0;
    let completes = matches!(
        msg.protocol_op,
        ProtocolOp::BindResponse(_)
            | ProtocolOp::SearchResultDone(_)
            | ProtocolOp::ModifyResponse(_)
            | ProtocolOp::AddResponse(_)
            | ProtocolOp::DelResponse(_)
            | ProtocolOp::ModDnResponse(_)
            | ProtocolOp::CompareResponse(_)
            | ProtocolOp::ExtendedResponse(_)
    );
    let tx = {
        let mut pending = lock(&inner.pending);
        match pending.table.get(&id) {
            Some(waiter) => {
                let tx = waiter.tx.clone();
                if completes {
                    pending.table.remove(&id);
                }
                Some(tx)
            }
            None => None,
        }
    };
    match tx {
        // blocking send: a full sink applies backpressure to this reader (and the socket)
        Some(tx) => {
            let _ = tx.send(SinkItem::Msg(msg));
        }
        None => log::debug!("discarding response for unknown or abandoned id {}", id),
    }
    false
}

fn handle_unsolicited(inner: &Arc<ConnInner>, msg: LdapMessage<'static>) -> bool {
    match msg.protocol_op {
        ProtocolOp::ExtendedResponse(resp) => {
            let is_disconnect = resp
                .response_name
                .as_ref()
                .map(|name| name.0 == oid::NOTICE_OF_DISCONNECTION)
                .unwrap_or(false);
            if is_disconnect {
                log::warn!(
                    "server notice of disconnection: {:?} {}",
                    resp.result.result_code,
                    resp.result.diagnostic_message.0
                );
            }
            lock(&inner.unsolicited).push(resp);
            is_disconnect
        }
        _ => {
            log::warn!("ignoring unsolicited non-extended message");
            false
        }
    }
}

fn close_connection(inner: &Arc<ConnInner>, cause: Error) {
    log::debug!("reader terminating: {}", cause);
    *lock(&inner.state) = ConnState::Closed;
    let mut writer = lock(&inner.writer);
    if let Some(w) = writer.as_ref() {
        w.shutdown();
    }
    *writer = None;
    drop(writer);
    let waiters: Vec<Waiter> = lock(&inner.pending)
        .table
        .drain()
        .map(|(_, waiter)| waiter)
        .collect();
    for waiter in waiters {
        let _ = waiter.tx.try_send(SinkItem::Failed(Error::ConnectionClosed));
    }
}

// ---- search streams ----

/// Per-search tunables beyond the required parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    /// Override of the connection's search buffer high-water mark; 0 = rendezvous
    pub buffer: Option<usize>,
    pub timeout: Option<Duration>,
    pub controls: Vec<Control<'static>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            deref_aliases: DerefAliases::NeverDerefAliases,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            buffer: None,
            timeout: None,
            controls: Vec::new(),
        }
    }
}

/// One streamed search result.
#[derive(Debug, Clone)]
pub enum SearchItem {
    /// An entry with the controls attached to its message
    Entry(SearchResultEntry<'static>, Vec<Control<'static>>),
    /// A continuation reference with its controls
    Reference(Vec<String>, Vec<Control<'static>>),
}

/// Lazy, finite, non-restartable stream of search results.
///
/// Drive it with [`next`](SearchStream::next) until `Ok(None)`, then read the terminal result
/// via [`take_outcome`](SearchStream::take_outcome). Dropping the stream before the done
/// message abandons the search on the server.
pub struct SearchStream {
    conn: LdapConnection,
    id: u32,
    rx: Receiver<SinkItem>,
    deadline: Option<Instant>,
    outcome: Option<OperationResult>,
    terminated: bool,
    aborted: bool,
}

impl std::fmt::Debug for SearchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchStream")
            .field("id", &self.id)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl SearchStream {
    /// The message ID of the underlying search.
    pub fn id(&self) -> MessageID {
        MessageID(self.id)
    }

    /// Next entry or reference; `Ok(None)` after the terminal done message.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<SearchItem>, Error> {
        if self.aborted {
            self.aborted = false;
            self.terminated = true;
            return Err(Error::Abandoned);
        }
        if self.terminated {
            return Ok(None);
        }
        loop {
            let item = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.terminated = true;
                        let _ = self.conn.abandon_id(self.id);
                        return Err(Error::Timeout);
                    }
                    match self.rx.recv_timeout(deadline - now) {
                        Ok(item) => item,
                        Err(RecvTimeoutError::Timeout) => {
                            self.terminated = true;
                            let _ = self.conn.abandon_id(self.id);
                            return Err(Error::Timeout);
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            self.terminated = true;
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }
                None => match self.rx.recv() {
                    Ok(item) => item,
                    Err(_) => {
                        self.terminated = true;
                        return Err(Error::ConnectionClosed);
                    }
                },
            };
            match item {
                SinkItem::Msg(msg) => {
                    let controls = msg.controls.unwrap_or_default();
                    match msg.protocol_op {
                        ProtocolOp::SearchResultEntry(entry) => {
                            return Ok(Some(SearchItem::Entry(entry, controls)))
                        }
                        ProtocolOp::SearchResultReference(urls) => {
                            return Ok(Some(SearchItem::Reference(
                                urls.into_iter().map(|u| u.0.into_owned()).collect(),
                                controls,
                            )))
                        }
                        ProtocolOp::SearchResultDone(result) => {
                            self.outcome =
                                Some(OperationResult::from_wire(&result, Some(controls)));
                            self.terminated = true;
                            return Ok(None);
                        }
                        ProtocolOp::IntermediateResponse(_) => {
                            log::debug!("interim response within search {}", self.id);
                        }
                        _ => {
                            self.terminated = true;
                            return Err(Error::Protocol(LdapError::InvalidMessageType));
                        }
                    }
                }
                SinkItem::Failed(e) => {
                    self.terminated = true;
                    return Err(e);
                }
            }
        }
    }

    /// Response controls from the terminal done message, available once the stream ended.
    pub fn outcome(&self) -> Option<&OperationResult> {
        self.outcome.as_ref()
    }

    /// The terminal result; call after `next` returned `Ok(None)`.
    pub fn take_outcome(&mut self) -> Result<OperationResult, Error> {
        self.outcome.take().ok_or(Error::ConnectionClosed)
    }

    /// Cancel the search: sends `abandonRequest`, the next `next()` call reports
    /// [`Error::Abandoned`].
    pub fn abandon(&mut self) -> Result<(), Error> {
        if self.terminated || self.aborted {
            return Ok(());
        }
        self.aborted = true;
        self.conn.abandon_id(self.id)
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        if !self.terminated && !self.aborted {
            let _ = self.conn.abandon_id(self.id);
        }
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        // last user-facing handle (the reader thread holds the other reference): tear down so
        // the reader does not outlive every caller
        if Arc::strong_count(&self.inner) <= 2 && self.is_open() {
            let _ = self.unbind();
        }
    }
}

// ---- helpers used by the object layer ----

impl LdapConnection {
    /// Base-scoped search for a specific entry's attributes; `Ok(None)` when the entry does
    /// not exist.
    pub(crate) fn read_entry_attrs(
        &self,
        dn: &str,
        attrs: &[&str],
    ) -> Result<Option<AttributeMap>, Error> {
        let result = self.search_collect(dn, SearchScope::BaseObject, "(objectClass=*)", attrs);
        match result {
            Ok((entries, _)) => Ok(entries
                .first()
                .map(|entry| AttributeMap::from_entry(entry, Some(self.schema())))),
            Err(Error::OperationFailed {
                result_code: ResultCode::NoSuchObject,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_id_skips_zero_and_outstanding() {
        let mut pending = Pending {
            next_id: u32::MAX,
            table: HashMap::new(),
        };
        assert_eq!(allocate_id(&mut pending).unwrap(), u32::MAX);
        // wraps past zero
        assert_eq!(allocate_id(&mut pending).unwrap(), 1);
        let (tx, _rx) = mpsc::sync_channel(1);
        pending.table.insert(2, Waiter { tx });
        // 2 is outstanding, skipped
        assert_eq!(allocate_id(&mut pending).unwrap(), 3);
    }

    #[test]
    fn test_allocate_id_exhaustion() {
        let mut pending = Pending {
            next_id: 1,
            table: HashMap::new(),
        };
        for id in 1..=MAX_OUTSTANDING as u32 {
            let (tx, rx) = mpsc::sync_channel(1);
            pending.table.insert(id, Waiter { tx });
            std::mem::forget(rx);
        }
        assert!(matches!(
            allocate_id(&mut pending),
            Err(Error::TooManyOutstanding)
        ));
    }

    #[test]
    fn test_allowed_during_bind() {
        assert!(allowed_during_bind(&ProtocolOp::UnbindRequest));
        assert!(allowed_during_bind(&ProtocolOp::AbandonRequest(MessageID(4))));
        assert!(allowed_during_bind(&ProtocolOp::ExtendedRequest(
            ExtendedRequest {
                request_name: crate::ldap::LdapOID(Cow::Borrowed(oid::START_TLS)),
                request_value: None,
            }
        )));
        assert!(!allowed_during_bind(&ProtocolOp::DelRequest(LdapDN(
            Cow::Borrowed("cn=x")
        ))));
    }
}
