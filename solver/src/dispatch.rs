//! Security-gated dispatch of proposed actions.
//!
//! Every action is classified first. Allowed actions are routed to the
//! built-in file reader, the script fallback chains, or the execution gateway.
//! Anything that does not run (denials, path escapes, missing engines, spawn
//! failures) comes back as a refusal the model can route around.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::SecurityPolicy;
use crate::core::types::{
    Decision, ExecutionResult, ProposedAction, ReasonCode, TOOL_READ_FILE, TOOL_SCRIPT, Verdict,
};
use crate::io::process::{self, Limits};
use crate::io::scripts::{ScriptRequest, ScriptRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed {
        result: ExecutionResult,
        backend: Option<String>,
        skipped: Vec<String>,
    },
    Refused {
        message: String,
    },
}

impl DispatchOutcome {
    /// Text shown to the model.
    pub fn render(&self) -> String {
        match self {
            DispatchOutcome::Executed {
                result, skipped, ..
            } => {
                let mut text = result.render();
                if !skipped.is_empty() {
                    text.push_str(&format!("\n[unavailable engines skipped: {}]", skipped.join(", ")));
                }
                text
            }
            DispatchOutcome::Refused { message } => format!("action refused: {message}"),
        }
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self, DispatchOutcome::Executed { result, .. } if result.cancelled)
    }
}

/// Short human-readable form of an action.
pub fn describe_action(action: &ProposedAction) -> String {
    match action.tool.as_str() {
        TOOL_SCRIPT => format!(
            "script ({})",
            action.args.first().map(String::as_str).unwrap_or("?")
        ),
        _ if action.args.is_empty() => action.tool.clone(),
        _ => format!("{} {}", action.tool, action.args.join(" ")),
    }
}

pub struct Dispatcher {
    policy: Arc<SecurityPolicy>,
    scripts: Arc<ScriptRunner>,
    output_limit_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        scripts: Arc<ScriptRunner>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            policy,
            scripts,
            output_limit_bytes,
        }
    }

    pub fn script_languages(&self) -> Vec<String> {
        self.scripts
            .languages()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Classify and log. ALLOW_AUDIT decisions go to the audit target.
    ///
    /// A script inherits the confirmation requirement of any interpreter in
    /// its language's chain, so it cannot run code those interpreters would
    /// have paused for.
    pub fn classify(&self, session: &str, action: &ProposedAction) -> Decision {
        let mut decision = self.policy.classify(&action.tool, &action.args);
        if decision.command == TOOL_SCRIPT
            && decision.verdict.permits_execution()
            && let Some(language) = action.args.first()
            && self
                .scripts
                .engines(language)
                .into_iter()
                .any(|engine| self.policy.requires_confirmation(engine))
        {
            decision.requires_confirmation = true;
        }
        match decision.verdict {
            Verdict::Allow => {
                debug!(session, command = %decision.command, reason = ?decision.reason, "allow");
            }
            Verdict::AllowAudit => {
                let pattern = match &decision.reason {
                    ReasonCode::HeuristicAllow { pattern } => pattern.as_str(),
                    _ => "",
                };
                warn!(
                    target: "solver::audit",
                    session,
                    command = %decision.command,
                    args = ?decision.args,
                    pattern,
                    "ALLOW_AUDIT"
                );
            }
            Verdict::Deny => {
                info!(session, command = %decision.command, reason = ?decision.reason, "deny");
            }
        }
        decision
    }

    /// Run an action whose decision permits execution.
    #[instrument(skip_all, fields(command = %decision.command))]
    pub async fn execute(
        &self,
        decision: &Decision,
        action: &ProposedAction,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        if !decision.verdict.permits_execution() {
            return DispatchOutcome::Refused {
                message: format!("'{}' is not permitted: {}", decision.command, decision.reason.describe()),
            };
        }
        let limits = Limits {
            timeout,
            output_limit_bytes: self.output_limit_bytes,
        };

        match decision.command.as_str() {
            TOOL_READ_FILE => {
                let Some(path) = action.args.first() else {
                    return DispatchOutcome::Refused {
                        message: "read_file needs a path".to_string(),
                    };
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => DispatchOutcome::Executed {
                        result: ExecutionResult {
                            exit_code: None,
                            stdout: String::new(),
                            stderr: String::new(),
                            duration_ms: 0,
                            truncated: false,
                            timed_out: false,
                            cancelled: true,
                        },
                        backend: None,
                        skipped: Vec::new(),
                    },
                    outcome = read_file_scoped(cwd, path, self.output_limit_bytes) => outcome,
                    () = tokio::time::sleep(timeout) => DispatchOutcome::Refused {
                        message: format!("reading '{path}' timed out after {}ms", timeout.as_millis()),
                    },
                }
            }
            TOOL_SCRIPT => {
                let language = action.args.first().map(String::as_str).unwrap_or_default();
                let request = ScriptRequest {
                    code: action.stdin.clone().unwrap_or_default(),
                    cwd: cwd.to_path_buf(),
                    limits,
                    cancel: cancel.clone(),
                };
                match self.scripts.run(language, &request).await {
                    Ok(output) => DispatchOutcome::Executed {
                        result: output.output,
                        backend: Some(output.backend),
                        skipped: output.skipped.into_iter().map(|s| s.backend).collect(),
                    },
                    Err(err) => DispatchOutcome::Refused {
                        message: err.to_string(),
                    },
                }
            }
            // The normalized name is executed (resolved through PATH), so a
            // path argument cannot smuggle a different binary behind an
            // allowed basename.
            program => match process::execute(
                program,
                &action.args,
                action.stdin.as_deref(),
                cwd,
                limits,
                cancel,
            )
            .await
            {
                Ok(result) => DispatchOutcome::Executed {
                    result,
                    backend: None,
                    skipped: Vec::new(),
                },
                Err(err) => DispatchOutcome::Refused {
                    message: format!("failed to start '{program}': {err:#}"),
                },
            },
        }
    }
}

/// Resolve `requested` inside `root`; `None` when it escapes or does not exist.
fn resolve_inside(root: &Path, requested: &str) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let candidate = root.join(requested).canonicalize().ok()?;
    candidate.starts_with(&root).then_some(candidate)
}

async fn read_file_scoped(root: &Path, requested: &str, limit: usize) -> DispatchOutcome {
    let started = Instant::now();
    let Some(path) = resolve_inside(root, requested) else {
        warn!(requested, "read_file outside the challenge directory or missing");
        return DispatchOutcome::Refused {
            message: format!("'{requested}' does not exist inside the challenge directory"),
        };
    };
    // Directories, FIFOs and device nodes are never opened.
    if !path.is_file() {
        return DispatchOutcome::Refused {
            message: format!("'{requested}' is not a regular file"),
        };
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            return DispatchOutcome::Refused {
                message: format!("cannot open '{requested}': {err}"),
            };
        }
    };
    let mut buf = Vec::new();
    let mut reader = file.take(limit as u64 + 1);
    if let Err(err) = reader.read_to_end(&mut buf).await {
        return DispatchOutcome::Refused {
            message: format!("cannot read '{requested}': {err}"),
        };
    }
    let truncated = buf.len() > limit;
    buf.truncate(limit);

    DispatchOutcome::Executed {
        result: ExecutionResult {
            exit_code: Some(0),
            stdout: String::from_utf8_lossy(&buf).into_owned(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            truncated,
            timed_out: false,
            cancelled: false,
        },
        backend: None,
        skipped: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use super::*;
    use crate::io::policy::load_policy;

    fn dispatcher(limit: usize) -> Dispatcher {
        Dispatcher::new(
            load_policy(None).expect("policy"),
            Arc::new(ScriptRunner::from_config(&BTreeMap::new())),
            limit,
        )
    }

    fn action(tool: &str, args: &[&str]) -> ProposedAction {
        ProposedAction {
            tool: tool.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            stdin: None,
            raw: String::new(),
        }
    }

    async fn run(d: &Dispatcher, cwd: &Path, action: &ProposedAction) -> DispatchOutcome {
        let decision = d.classify("test", action);
        d.execute(
            &decision,
            action,
            cwd,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn read_file_stays_inside_challenge_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("chal");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("notes.txt"), "hello").expect("write");
        fs::write(temp.path().join("secret.txt"), "nope").expect("write");
        let d = dispatcher(1_000);

        let ok = run(&d, &root, &action("read_file", &["notes.txt"])).await;
        let DispatchOutcome::Executed { result, .. } = ok else {
            panic!("expected read");
        };
        assert_eq!(result.stdout, "hello");

        let escaped = run(&d, &root, &action("read_file", &["../secret.txt"])).await;
        assert!(matches!(escaped, DispatchOutcome::Refused { .. }));
        let absolute = temp.path().join("secret.txt");
        let escaped = run(
            &d,
            &root,
            &action("read_file", &[absolute.to_str().expect("utf8")]),
        )
        .await;
        assert!(matches!(escaped, DispatchOutcome::Refused { .. }));
    }

    #[tokio::test]
    async fn read_file_truncates_to_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("big.txt"), "x".repeat(500)).expect("write");
        let d = dispatcher(100);
        let outcome = run(&d, temp.path(), &action("read_file", &["big.txt"])).await;
        let DispatchOutcome::Executed { result, .. } = outcome else {
            panic!("expected read");
        };
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_file_refuses_special_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("sub")).expect("mkdir");
        let status = std::process::Command::new("mkfifo")
            .arg(temp.path().join("pipe"))
            .status()
            .expect("mkfifo");
        assert!(status.success());
        let d = dispatcher(1_000);

        for name in ["sub", "pipe"] {
            let started = Instant::now();
            let outcome = run(&d, temp.path(), &action("read_file", &[name])).await;
            let refused = matches!(
                &outcome,
                DispatchOutcome::Refused { message } if message.contains("not a regular file")
            );
            assert!(refused, "{name}: {outcome:?}");
            assert!(started.elapsed() < Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn read_file_observes_cancellation() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("notes.txt"), "hello").expect("write");
        let d = dispatcher(1_000);
        let proposed = action("read_file", &["notes.txt"]);
        let decision = d.classify("test", &proposed);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = d
            .execute(&decision, &proposed, temp.path(), Duration::from_secs(5), &cancel)
            .await;
        assert!(outcome.was_cancelled());
    }

    #[test]
    fn scripts_inherit_interpreter_confirmation() {
        let scripts = BTreeMap::from([
            ("python".to_string(), vec!["python3".to_string(), "python".to_string()]),
            ("lua".to_string(), vec!["lua".to_string()]),
        ]);
        let d = Dispatcher::new(
            load_policy(None).expect("policy"),
            Arc::new(ScriptRunner::from_config(&scripts)),
            1_000,
        );

        let python = d.classify("test", &action("script", &["python"]));
        assert_eq!(python.verdict, Verdict::Allow);
        assert!(python.needs_human());

        let lua = d.classify("test", &action("script", &["lua"]));
        assert_eq!(lua.verdict, Verdict::Allow);
        assert!(!lua.needs_human());

        assert!(!d.classify("test", &action("read_file", &["a"])).needs_human());
    }

    #[tokio::test]
    async fn denied_commands_never_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("keep.txt"), "x").expect("write");
        let d = dispatcher(1_000);
        for (tool, args) in [
            ("rm", vec!["keep.txt"]),
            ("/bin/rm", vec!["-rf", "keep.txt"]),
            ("rm", vec!["; ls"]),
            ("rm", vec!["$(ls)"]),
            ("ls; rm", vec!["keep.txt"]),
        ] {
            let proposed = action(tool, &args);
            let decision = d.classify("test", &proposed);
            assert_eq!(decision.verdict, Verdict::Deny, "{tool}");
            let outcome = run(&d, temp.path(), &proposed).await;
            assert!(outcome.render().starts_with("action refused"));
        }
        assert!(temp.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn metacharacters_in_args_are_literal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let d = dispatcher(1_000);
        let outcome = run(&d, temp.path(), &action("echo", &["a; ls", "$(id)"])).await;
        let DispatchOutcome::Executed { result, .. } = outcome else {
            panic!("expected execution");
        };
        assert_eq!(result.stdout.trim(), "a; ls $(id)");
    }

    #[tokio::test]
    async fn unknown_script_language_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let d = dispatcher(1_000);
        let mut proposed = action("script", &["cobol"]);
        proposed.stdin = Some("DISPLAY 'HI'".to_string());
        let outcome = run(&d, temp.path(), &proposed).await;
        assert!(matches!(outcome, DispatchOutcome::Refused { .. }));
    }

    #[test]
    fn describes_actions() {
        assert_eq!(describe_action(&action("strings", &["a.bin"])), "strings a.bin");
        assert_eq!(describe_action(&action("script", &["python"])), "script (python)");
        assert_eq!(describe_action(&action("ls", &[])), "ls");
    }
}
