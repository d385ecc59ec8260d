//! Runs the external scraping tool as a child process.
//!
//! The child gets its working directory through `current_dir`, so the
//! host process never changes directory and concurrent invocations from
//! different workers do not interfere. Each call drives the child on its
//! own current-thread tokio runtime and blocks the caller until the child
//! exits, fails or times out.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};

use crate::error::InvokeError;
use crate::scraper::command::{ConfirmPolicy, InvokeRequest};

/// Bytes of recent output kept for prompt matching and diagnostics.
const OUTPUT_WINDOW: usize = 4096;

#[derive(Debug, Clone)]
pub struct InvokeReport {
    pub exit_code: i32,
    pub prompt_answered: bool,
    pub duration: Duration,
    pub stdout_tail: String,
}

/// Something that can execute a scrape command to completion.
pub trait ScrapeRunner: Send + Sync {
    fn run(&self, request: &InvokeRequest) -> Result<InvokeReport, InvokeError>;
}

/// Runs the real tool as an operating-system process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInvoker;

impl ProcessInvoker {
    pub fn new() -> Self {
        Self
    }
}

impl ScrapeRunner for ProcessInvoker {
    fn run(&self, request: &InvokeRequest) -> Result<InvokeReport, InvokeError> {
        let working_directory = &request.command.working_directory;
        if !working_directory.is_dir() {
            return Err(InvokeError::MissingWorkingDirectory(
                working_directory.clone(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(invoke(request))
    }
}

async fn invoke(request: &InvokeRequest) -> Result<InvokeReport, InvokeError> {
    let started = Instant::now();
    let command = &request.command;

    tracing::info!(command = %command, cwd = %command.working_directory.display(), "Starting scraper");

    let mut cmd = TokioCommand::new(&command.program);
    cmd.current_dir(&command.working_directory)
        .args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| InvokeError::Spawn {
        program: command.program.clone(),
        source: e,
    })?;

    let outcome = tokio::time::timeout(request.timeout, drive(&mut child, &request.confirm)).await;

    let (exit_code, conversation, stderr_text) = match outcome {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => {
            terminate(&mut child).await;
            tracing::warn!(error = %e, "Scraper aborted");
            return Err(e);
        }
        Err(_) => {
            terminate(&mut child).await;
            tracing::warn!(timeout_secs = request.timeout.as_secs(), "Scraper timed out");
            return Err(InvokeError::Timeout {
                secs: request.timeout.as_secs(),
            });
        }
    };

    let duration = started.elapsed();
    if exit_code != 0 {
        return Err(InvokeError::NonZeroExit {
            code: exit_code,
            stderr: tail(&stderr_text, 1000).trim().to_string(),
        });
    }

    tracing::info!(
        elapsed_ms = duration.as_millis() as u64,
        prompt_answered = conversation.prompt_answered,
        "Scraper finished"
    );

    Ok(InvokeReport {
        exit_code,
        prompt_answered: conversation.prompt_answered,
        duration,
        stdout_tail: conversation.output_tail,
    })
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Failed to kill scraper process");
    }
}

struct Conversation {
    prompt_answered: bool,
    output_tail: String,
}

async fn drive(
    child: &mut Child,
    confirm: &ConfirmPolicy,
) -> Result<(i32, Conversation, String), InvokeError> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stderr_task = async {
        let mut collected = String::new();
        if let Some(stderr) = stderr_pipe {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "scrapeflow::scraper::stderr", "{}", line);
                collected.push_str(&line);
                collected.push('\n');
                if collected.len() > OUTPUT_WINDOW * 2 {
                    collected = tail(&collected, OUTPUT_WINDOW).to_string();
                }
            }
        }
        Ok::<_, InvokeError>(collected)
    };

    let (stderr_text, conversation) = tokio::try_join!(stderr_task, converse(stdout, stdin, confirm))?;

    let status = child.wait().await?;
    Ok((status.code().unwrap_or(-1), conversation, stderr_text))
}

/// Reads stdout in raw chunks (prompts usually lack a trailing newline)
/// and answers the confirmation prompt the first time it appears.
async fn converse(
    stdout: Option<ChildStdout>,
    mut stdin: Option<ChildStdin>,
    confirm: &ConfirmPolicy,
) -> Result<Conversation, InvokeError> {
    let mut conversation = Conversation {
        prompt_answered: false,
        output_tail: String::new(),
    };
    let Some(mut stdout) = stdout else {
        return Ok(conversation);
    };

    let prompt_deadline = tokio::time::Instant::now() + confirm.prompt_timeout;
    let mut window = String::new();
    let mut chunk = [0u8; 1024];

    loop {
        let read = if confirm.required && !conversation.prompt_answered {
            match tokio::time::timeout_at(prompt_deadline, stdout.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => {
                    return Err(InvokeError::PromptTimeout {
                        secs: confirm.prompt_timeout.as_secs(),
                    })
                }
            }
        } else {
            stdout.read(&mut chunk).await?
        };

        if read == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&chunk[..read]);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            tracing::trace!(target: "scrapeflow::scraper::stdout", "{}", line);
        }
        conversation.output_tail.push_str(&text);
        if conversation.output_tail.len() > OUTPUT_WINDOW * 2 {
            conversation.output_tail = tail(&conversation.output_tail, OUTPUT_WINDOW).to_string();
        }

        if conversation.prompt_answered {
            continue;
        }

        window.push_str(&text);
        if confirm.pattern.is_match(&window) {
            if let Some(mut input) = stdin.take() {
                input
                    .write_all(format!("{}\n", confirm.response).as_bytes())
                    .await?;
                input.flush().await?;
            }
            tracing::debug!("Answered confirmation prompt");
            conversation.prompt_answered = true;
            window.clear();
        } else if window.len() > OUTPUT_WINDOW {
            window = tail(&window, OUTPUT_WINDOW).to_string();
        }
    }

    Ok(conversation)
}

/// Last `max` bytes of `text`, cut at a character boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
