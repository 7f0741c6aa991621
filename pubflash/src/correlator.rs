//! Request/response correlation over the console line stream.
//!
//! The device answers textual commands with `key: value` lines followed by
//! its shell prompt, interleaved with ordinary log chatter. A [`Query`]
//! describes which fields to collect and when the answer is complete; the
//! [`Correlator`] registers a transient interceptor on the
//! [`ListenerChain`], sends the command, and waits for completion or timeout.
//!
//! Only one query of a given kind should be pending at a time. Two queries
//! racing on the same stream would both see every line.

use crate::chain::{InterceptorId, ListenerChain};
use crate::error::{Error, Result};
use crate::sink::{Severity, lock};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shell prompt printed by the device once it has finished answering.
pub const PROMPT: &str = "pubconsole>";

/// Default time to wait for a correlated response.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Field name to value mapping collected from a response.
pub type Fields = BTreeMap<String, String>;

/// Completion predicate: receives the current line and the fields so far.
pub type Completion = Arc<dyn Fn(&str, &Fields) -> bool + Send + Sync>;

/// Extract the value of a case-insensitive `key: value` line.
pub fn match_field(line: &str, key: &str) -> Option<String> {
    let head = line.get(..key.len())?;
    if !head.eq_ignore_ascii_case(key) {
        return None;
    }
    let value = line[key.len()..].strip_prefix(':')?;
    Some(value.trim().to_string())
}

/// Description of a correlated command.
#[derive(Clone)]
pub struct Query {
    command: String,
    fields: Vec<String>,
    completion: Completion,
    timeout: Duration,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("command", &self.command)
            .field("fields", &self.fields)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// A query that collects `fields` and completes on the prompt line.
    pub fn new(command: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            command: command.into(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            completion: Arc::new(|line: &str, _: &Fields| line == PROMPT),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// The `version` query: completes on the prompt once version and variant arrived.
    pub fn version() -> Self {
        Self::new("version", &["version", "variant", "hardware"]).complete_when(|line, fields| {
            line == PROMPT && fields.contains_key("version") && fields.contains_key("variant")
        })
    }

    /// The `settings` query: collects the Wi-Fi credentials.
    pub fn settings() -> Self {
        Self::new("settings", &["wifi_ssid", "wifi_password"])
    }

    /// Replace the completion predicate.
    #[must_use]
    pub fn complete_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &Fields) -> bool + Send + Sync + 'static,
    {
        self.completion = Arc::new(predicate);
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command text sent to the device.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Field names collected from the response.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Response timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

struct Pending {
    fields: Fields,
    resolved: bool,
}

/// Runs [`Query`]s against a listener chain.
#[derive(Debug, Clone)]
pub struct Correlator {
    chain: ListenerChain,
}

impl Correlator {
    /// Create a correlator intercepting lines on `chain`.
    pub fn new(chain: ListenerChain) -> Self {
        Self { chain }
    }

    /// Send `query`'s command through `send` and wait for the response.
    ///
    /// The interceptor is in place before `send` runs and is removed on every
    /// exit path. While active it claims every line, so response traffic
    /// never reaches the sink.
    pub fn query<S>(&self, query: &Query, send: S) -> Result<Fields>
    where
        S: FnOnce(&str) -> Result<()>,
    {
        let (tx, rx) = mpsc::channel();
        let id = self.install(query, tx);

        debug!("Sending correlated command '{}'", query.command);
        if let Err(err) = send(&query.command) {
            self.chain.unregister(id);
            return Err(err);
        }

        let outcome = rx.recv_timeout(query.timeout);
        self.chain.unregister(id);

        match outcome {
            Ok(fields) => {
                debug!("'{}' resolved with {} field(s)", query.command, fields.len());
                Ok(fields)
            },
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                Err(Error::Timeout(format!(
                    "no response to '{}' within {} ms",
                    query.command,
                    query.timeout.as_millis()
                )))
            },
        }
    }

    fn install(&self, query: &Query, tx: mpsc::Sender<Fields>) -> InterceptorId {
        let keys = query.fields.clone();
        let completion = Arc::clone(&query.completion);
        let pending = Mutex::new(Pending {
            fields: Fields::new(),
            resolved: false,
        });

        self.chain.register(move |line: &str, _: Severity| {
            let mut pending = lock(&pending);
            if pending.resolved {
                return false;
            }
            for key in &keys {
                if let Some(value) = match_field(line, key) {
                    pending.fields.insert(key.clone(), value);
                }
            }
            if completion(line, &pending.fields) {
                pending.resolved = true;
                let _ = tx.send(pending.fields.clone());
            }
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use std::time::Instant;

    fn setup() -> (LogSink, ListenerChain, Correlator) {
        let sink = LogSink::new();
        let chain = ListenerChain::new(sink.clone());
        let correlator = Correlator::new(chain.clone());
        (sink, chain, correlator)
    }

    #[test]
    fn test_match_field() {
        assert_eq!(match_field("version: 1.2.3", "version"), Some("1.2.3".into()));
        assert_eq!(match_field("VERSION:  2.0 ", "version"), Some("2.0".into()));
        assert_eq!(match_field("wifi_ssid:", "wifi_ssid"), Some(String::new()));
        assert_eq!(match_field("versions: 1", "version"), None);
        assert_eq!(match_field("ver", "version"), None);
        assert_eq!(match_field("my version: 1", "version"), None);
    }

    #[test]
    fn test_version_query_resolves_fields() {
        let (sink, chain, correlator) = setup();
        let feeder = chain.clone();

        let fields = correlator
            .query(&Query::version(), |command| {
                assert_eq!(command, "version");
                for line in ["version: 1.2.3", "variant: std", "hardware: v1", PROMPT] {
                    feeder.dispatch(line, Severity::Info);
                }
                Ok(())
            })
            .unwrap();

        let expected: Fields = [("version", "1.2.3"), ("variant", "std"), ("hardware", "v1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(fields, expected);
        assert!(sink.is_empty(), "response lines must not leak into the log");
        assert!(chain.is_empty());
    }

    #[test]
    fn test_prompt_before_required_fields_does_not_resolve() {
        let (_sink, chain, correlator) = setup();
        let feeder = chain.clone();
        let query = Query::version().with_timeout(Duration::from_millis(500));

        let fields = correlator
            .query(&query, |_| {
                feeder.dispatch(PROMPT, Severity::Info);
                feeder.dispatch("version: 3.1", Severity::Info);
                feeder.dispatch("variant: dual", Severity::Info);
                feeder.dispatch(PROMPT, Severity::Info);
                Ok(())
            })
            .unwrap();
        assert_eq!(fields.get("version").map(String::as_str), Some("3.1"));
        assert!(!fields.contains_key("hardware"));
    }

    #[test]
    fn test_response_from_another_thread() {
        let (_sink, chain, correlator) = setup();
        let feeder = chain.clone();

        let fields = correlator
            .query(&Query::settings(), move |_| {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    feeder.dispatch("wifi_ssid: home", Severity::Info);
                    feeder.dispatch("wifi_password: hunter2", Severity::Info);
                    feeder.dispatch(PROMPT, Severity::Info);
                });
                Ok(())
            })
            .unwrap();
        assert_eq!(fields["wifi_ssid"], "home");
        assert_eq!(fields["wifi_password"], "hunter2");
    }

    #[test]
    fn test_timeout_removes_interceptor() {
        let (sink, chain, correlator) = setup();
        let query = Query::version().with_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let err = correlator.query(&query, |_| Ok(())).unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1000));
        assert!(chain.is_empty());

        chain.dispatch("version: 9.9", Severity::Info);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_send_failure_removes_interceptor() {
        let (_sink, chain, correlator) = setup();
        let err = correlator
            .query(&Query::settings(), |_| Err(Error::NotConnected))
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_chatter_during_query_is_claimed() {
        let (sink, chain, correlator) = setup();
        let feeder = chain.clone();

        correlator
            .query(&Query::settings(), |_| {
                feeder.dispatch("(100) wifi: scanning", Severity::Info);
                feeder.dispatch(PROMPT, Severity::Info);
                Ok(())
            })
            .unwrap();
        assert!(sink.is_empty());
    }
}
