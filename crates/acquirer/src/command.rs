//! External-program acquirer
//!
//! Runs a helper program (typically a browser automation script) that logs in
//! and prints the resulting cookies on stdout as JSON, in either form:
//!
//! ```json
//! {"cookies": {"name": "value"}}
//! [{"name": "name", "value": "value", "domain": ".example.com"}]
//! ```
//!
//! The acquisition budget is passed to the program in `SESSION_ACQUIRE_BUDGET_SECS`.
//! The child is killed if the budget runs out.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use chrono::{Local, NaiveTime, Utc};
use serde::Deserialize;
use session_store::CredentialSet;
use tracing::{debug, info, warn};

use crate::expiry::resolve_expiry;
use crate::{AcquireError, CredentialAcquirer, Result};

/// Environment variable carrying the budget (whole seconds) to the child.
pub const BUDGET_ENV: &str = "SESSION_ACQUIRE_BUDGET_SECS";

/// Bytes of stderr kept for error reports.
const STDERR_TAIL: usize = 512;

/// How to run the helper program and interpret its cookies.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub program: String,
    pub args: Vec<String>,
    /// Cookie that must be present for the set to count as a login
    pub required_cookie: String,
    /// Cookie holding a JWT whose `exp` claim is the session expiry
    pub expiry_cookie: String,
    /// Keep only records whose domain contains this (list form only)
    pub cookie_domain: Option<String>,
    /// Local time of day used as expiry when no JWT claim is found
    pub fallback_expiry: NaiveTime,
}

/// Acquirer that delegates the login to an external program.
pub struct CommandAcquirer {
    settings: CommandSettings,
}

impl CommandAcquirer {
    pub fn new(settings: CommandSettings) -> Self {
        Self { settings }
    }

    async fn run(&self, budget: Duration) -> Result<CredentialSet> {
        let settings = &self.settings;
        let started = std::time::Instant::now();

        let child = tokio::process::Command::new(&settings.program)
            .args(&settings.args)
            .env(BUDGET_ENV, budget.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AcquireError::Failed(format!("spawning {}: {e}", settings.program)))?;

        debug!(program = %settings.program, budget_secs = budget.as_secs(), "acquirer started");

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                AcquireError::Failed(format!("waiting on {}: {e}", settings.program))
            })?,
            Err(_) => {
                warn!(
                    program = %settings.program,
                    budget_secs = budget.as_secs(),
                    "acquirer exceeded budget, killed"
                );
                return Err(AcquireError::Timeout(budget));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AcquireError::Failed(format!(
                "{} exited with {}: {}",
                settings.program,
                output.status,
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let cookies = parse_cookie_output(&stdout, settings.cookie_domain.as_deref())?;

        if !cookies.contains_key(&settings.required_cookie) {
            return Err(AcquireError::Incomplete(format!(
                "missing required cookie {} ({} cookies returned)",
                settings.required_cookie,
                cookies.len()
            )));
        }

        let now = Local::now();
        let expires_at = resolve_expiry(
            &cookies,
            &settings.expiry_cookie,
            settings.fallback_expiry,
            &now,
        );

        info!(
            program = %settings.program,
            cookies = cookies.len(),
            expires_at = %expires_at,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "acquired session cookies"
        );

        Ok(CredentialSet::new(cookies, Utc::now(), Some(expires_at)))
    }
}

impl CredentialAcquirer for CommandAcquirer {
    fn id(&self) -> &str {
        "command"
    }

    fn acquire(
        &self,
        budget: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<CredentialSet>> + Send + '_>> {
        Box::pin(self.run(budget))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CookieOutput {
    // Tried first: a one-element list would otherwise match the map form
    Records(Vec<CookieRecord>),
    Map { cookies: HashMap<String, String> },
}

#[derive(Deserialize)]
struct CookieRecord {
    name: String,
    value: String,
    #[serde(default)]
    domain: Option<String>,
}

/// Parse the helper's stdout into a name → value map.
///
/// Records carrying a domain that does not contain `domain` are dropped;
/// records without a domain are kept. Later duplicates win.
fn parse_cookie_output(stdout: &str, domain: Option<&str>) -> Result<HashMap<String, String>> {
    let parsed: CookieOutput = serde_json::from_str(stdout.trim())
        .map_err(|e| AcquireError::Failed(format!("unparseable acquirer output: {e}")))?;

    let cookies = match parsed {
        CookieOutput::Records(records) => records
            .into_iter()
            .filter(|r| match (domain, r.domain.as_deref()) {
                (Some(want), Some(have)) => have.contains(want),
                _ => true,
            })
            .map(|r| (r.name, r.value))
            .collect(),
        CookieOutput::Map { cookies } => cookies,
    };

    Ok(cookies)
}

/// Last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(script: &str) -> CommandSettings {
        CommandSettings {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            required_cookie: "sid".into(),
            expiry_cookie: "jwt".into(),
            cookie_domain: Some("example.com".into()),
            fallback_expiry: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
        }
    }

    #[test]
    fn parses_map_form() {
        let cookies =
            parse_cookie_output(r#"{"cookies":{"sid":"abc","theme":"dark"}}"#, None).unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies["sid"], "abc");
    }

    #[test]
    fn filters_records_by_domain() {
        let out = r#"[
            {"name":"sid","value":"abc","domain":".example.com"},
            {"name":"tracker","value":"x","domain":".ads.net"},
            {"name":"local","value":"y"}
        ]"#;
        let cookies = parse_cookie_output(out, Some("example.com")).unwrap();
        assert_eq!(cookies.len(), 2);
        assert!(cookies.contains_key("sid"));
        assert!(cookies.contains_key("local"));
        assert!(!cookies.contains_key("tracker"));
    }

    #[test]
    fn single_record_list_is_not_mistaken_for_map() {
        let out = r#"[{"name":"sid","value":"abc","domain":".example.com"}]"#;
        let cookies = parse_cookie_output(out, None).unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies["sid"], "abc");
    }

    #[test]
    fn rejects_garbage_output() {
        let err = parse_cookie_output("login page html", None).unwrap_err();
        assert!(matches!(err, AcquireError::Failed(_)), "got {err:?}");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        // 'é' is two bytes; cutting inside it must move forward
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("aéb", 2), "b");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn acquires_cookies_from_program() {
        let acquirer = CommandAcquirer::new(settings(
            r#"echo '{"cookies":{"sid":"abc","theme":"dark"}}'"#,
        ));
        let set = acquirer.acquire(Duration::from_secs(10)).await.unwrap();
        assert_eq!(set.get("sid"), Some("abc"));
        assert!(set.expires_at.is_some(), "fallback expiry must be applied");
        assert!(set.is_valid("sid", Utc::now()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_budget_to_program() {
        let acquirer = CommandAcquirer::new(settings(
            r#"printf '{"cookies":{"sid":"%s"}}' "$SESSION_ACQUIRE_BUDGET_SECS""#,
        ));
        let set = acquirer.acquire(Duration::from_secs(42)).await.unwrap();
        assert_eq!(set.get("sid"), Some("42"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_required_cookie_is_incomplete() {
        let acquirer = CommandAcquirer::new(settings(r#"echo '{"cookies":{"theme":"dark"}}'"#));
        let err = acquirer.acquire(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, AcquireError::Incomplete(_)), "got {err:?}");
        assert!(err.to_string().contains("sid"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let acquirer = CommandAcquirer::new(settings("echo 'login button not found' >&2; exit 3"));
        let err = acquirer.acquire(Duration::from_secs(10)).await.unwrap_err();
        match err {
            AcquireError::Failed(msg) => {
                assert!(msg.contains("login button not found"), "got: {msg}");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_program_times_out() {
        let acquirer = CommandAcquirer::new(settings("sleep 5"));
        let started = std::time::Instant::now();
        let err = acquirer.acquire(Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err, AcquireError::Timeout(Duration::from_millis(200)));
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "child must not be awaited past budget"
        );
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let mut s = settings("");
        s.program = "/nonexistent/session-acquirer".into();
        let err = CommandAcquirer::new(s)
            .acquire(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Failed(_)), "got {err:?}");
    }
}
