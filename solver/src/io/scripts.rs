//! Script execution through per-language fallback chains of interpreters.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::types::ExecutionResult;
use crate::io::fallback::{Backend, BackendFailure, ChainError, ChainOutput, FallbackChain};
use crate::io::process::{self, Limits};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A script to run, plus where and under which limits.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub code: String,
    pub cwd: PathBuf,
    pub limits: Limits,
    pub cancel: CancellationToken,
}

/// One interpreter, invoked as `<program> [leading args] <script file>`.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    program: String,
    leading_args: Vec<String>,
    extension: &'static str,
}

impl ScriptEngine {
    pub fn new(program: &str, language: &str) -> Self {
        let leading_args = match program {
            "deno" | "bun" => vec!["run".to_string()],
            _ => Vec::new(),
        };
        let extension = match language {
            "javascript" | "js" => ".js",
            "python" | "py" => ".py",
            "ruby" => ".rb",
            "perl" => ".pl",
            _ => ".txt",
        };
        Self {
            program: program.to_string(),
            leading_args,
            extension,
        }
    }
}

#[async_trait]
impl Backend<ScriptRequest, ExecutionResult> for ScriptEngine {
    fn name(&self) -> &str {
        &self.program
    }

    async fn probe(&self) -> Result<(), String> {
        let program = self.program.clone();
        tokio::task::spawn_blocking(move || process::probe_program(&program, PROBE_TIMEOUT))
            .await
            .map_err(|err| format!("probe task failed: {err}"))?
    }

    async fn run(&self, request: &ScriptRequest) -> Result<ExecutionResult, BackendFailure> {
        let mut file = tempfile::Builder::new()
            .prefix("solver-script-")
            .suffix(self.extension)
            .tempfile()
            .map_err(|err| BackendFailure::Execution(format!("create script file: {err}")))?;
        file.write_all(request.code.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| BackendFailure::Execution(format!("write script file: {err}")))?;

        let mut args = self.leading_args.clone();
        args.push(file.path().display().to_string());
        debug!(engine = %self.program, script = %file.path().display(), "running script");

        match process::execute(
            &self.program,
            &args,
            None,
            &request.cwd,
            request.limits,
            &request.cancel,
        )
        .await
        {
            Ok(result) => Ok(result),
            Err(err) if process::is_not_found(&err) => {
                Err(BackendFailure::EngineUnavailable(format!("{err:#}")))
            }
            Err(err) => Err(BackendFailure::Execution(format!("{err:#}"))),
        }
    }
}

/// Language -> interpreter chain. Shared by every session so probe results
/// are cached for the whole process.
#[derive(Debug)]
pub struct ScriptRunner {
    chains: HashMap<String, FallbackChain<ScriptRequest, ExecutionResult>>,
}

impl ScriptRunner {
    pub fn from_config(scripts: &BTreeMap<String, Vec<String>>) -> Self {
        let chains = scripts
            .iter()
            .map(|(language, engines)| {
                let backends: Vec<Box<dyn Backend<ScriptRequest, ExecutionResult>>> = engines
                    .iter()
                    .map(|program| {
                        Box::new(ScriptEngine::new(program, language))
                            as Box<dyn Backend<ScriptRequest, ExecutionResult>>
                    })
                    .collect();
                (
                    language.to_lowercase(),
                    FallbackChain::new(language.clone(), backends),
                )
            })
            .collect();
        Self { chains }
    }

    pub fn languages(&self) -> Vec<&str> {
        let mut languages: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        languages.sort_unstable();
        languages
    }

    /// Interpreters configured for `language`, in fallback order.
    pub fn engines(&self, language: &str) -> Vec<&str> {
        self.chains
            .get(&language.to_lowercase())
            .map(FallbackChain::backend_names)
            .unwrap_or_default()
    }

    pub async fn run(
        &self,
        language: &str,
        request: &ScriptRequest,
    ) -> Result<ChainOutput<ExecutionResult>, ChainError> {
        let chain = self
            .chains
            .get(&language.to_lowercase())
            .ok_or_else(|| ChainError::Unsupported(language.to_string()))?;
        chain.run(request).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(code: &str, cwd: PathBuf) -> ScriptRequest {
        ScriptRequest {
            code: code.to_string(),
            cwd,
            limits: Limits {
                timeout: Duration::from_secs(10),
                output_limit_bytes: 10_000,
            },
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn falls_back_to_installed_engine() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut scripts = BTreeMap::new();
        // `cat` accepts --version and prints the script back, so it stands in
        // for an interpreter that is always present.
        scripts.insert(
            "text".to_string(),
            vec!["solver-missing-engine".to_string(), "cat".to_string()],
        );
        let runner = ScriptRunner::from_config(&scripts);

        let out = runner
            .run("text", &request("print me", temp.path().to_path_buf()))
            .await
            .expect("run");
        assert_eq!(out.backend, "cat");
        assert_eq!(out.output.stdout, "print me");
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].backend, "solver-missing-engine");
    }

    #[tokio::test]
    async fn unknown_language_is_unsupported() {
        let runner = ScriptRunner::from_config(&BTreeMap::new());
        let err = runner
            .run("cobol", &request("x", PathBuf::from(".")))
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::Unsupported("cobol".to_string()));
        assert!(runner.languages().is_empty());
    }
}
