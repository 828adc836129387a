//! S/MIME signing through an external `openssl smime` process.
//!
//! The [`Signer`] trait is the seam between the signing transformer and the
//! actual cryptography. [`OpensslSigner`] shells out to OpenSSL (or any
//! compatible launcher), streaming the message through the process pipes.

use std::{
    ffi::OsString,
    fmt::Display,
    future::Future,
    io,
    path::Path,
    pin::Pin,
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default wall-clock limit for one signing process.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default limit for the signed output kept in memory.
pub const DEFAULT_MAX_OUTPUT: usize = 64 * 1024 * 1024;

/// Diagnostics past this size are dropped.
const MAX_DIAGNOSTICS: usize = 64 * 1024;

/// Result type for signing operations.
pub type SignResult<T> = Result<T, SignError>;

/// Boxed future type for signing operations, enabling object safety.
pub type SignFuture<'a> = Pin<Box<dyn Future<Output = SignResult<Vec<u8>>> + Send + 'a>>;

/// Errors that can occur while signing a message.
#[derive(Debug)]
pub enum SignError {
    /// The signing process could not be started.
    Launch { program: String, source: io::Error },
    /// The signing process exited unsuccessfully.
    Process { code: Option<i32>, stderr: String },
    /// The signing process exceeded its time limit and was killed.
    Timeout(Duration),
    /// The signing operation was cancelled and the process killed.
    Cancelled,
    /// The signed output exceeded the configured limit.
    OutputTooLarge { limit: usize },
    /// The signing process succeeded without producing any output.
    EmptyOutput,
    /// An I/O error occurred while talking to the signing process.
    Io(io::Error),
}

impl Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::Launch { program, source } => {
                write!(f, "Failed to launch {program}: {source}")
            }
            SignError::Process {
                code: Some(code),
                stderr,
            } => write!(f, "Signing process failed (exit code {code}): {stderr}"),
            SignError::Process { code: None, stderr } => {
                write!(f, "Signing process terminated by signal: {stderr}")
            }
            SignError::Timeout(duration) => {
                write!(f, "Signing process timed out after {}ms", duration.as_millis())
            }
            SignError::Cancelled => write!(f, "Signing process cancelled"),
            SignError::OutputTooLarge { limit } => {
                write!(f, "Signed output exceeds {limit} bytes")
            }
            SignError::EmptyOutput => write!(f, "Signing process produced no output"),
            SignError::Io(e) => write!(f, "Signing process I/O error: {e}"),
        }
    }
}

impl std::error::Error for SignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignError::Launch { source, .. } => Some(source),
            SignError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Trait for S/MIME signers producing a non-detached signed message.
///
/// `bundle` points to a combined certificate and private key bundle that
/// is used both as the signer identity and as the signing key.
pub trait Signer: Send + Sync {
    /// Signs the raw message, returning the signed MIME structure.
    fn sign<'a>(&'a self, body: &'a [u8], bundle: &'a Path) -> SignFuture<'a>;

    /// Returns the name of this signer.
    fn name(&self) -> &str;
}

/// Signer running one `openssl smime -sign` process per message.
#[derive(Debug, Clone)]
pub struct OpensslSigner {
    program: String,
    launcher_args: Vec<String>,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
    max_output: usize,
    shutdown: CancellationToken,
}

impl OpensslSigner {
    /// Creates a signer invoking `openssl` from the `PATH`.
    pub fn new() -> Self {
        Self::with_launcher(["openssl"])
    }

    /// Creates a signer with a custom launcher, the first element is the
    /// program and the remaining ones are passed before the signing arguments.
    pub fn with_launcher<I, S>(launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut launcher = launcher.into_iter().map(Into::into);
        let program = launcher.next().unwrap_or_else(|| "openssl".to_string());
        Self {
            program,
            launcher_args: launcher.collect(),
            extra_args: Vec::new(),
            timeout: Some(DEFAULT_SIGN_TIMEOUT),
            max_output: DEFAULT_MAX_OUTPUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Appends arguments after the signing arguments (e.g. `-passin`).
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the time limit, `None` waits for the process indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    /// Replaces the token cancelling every signing started through
    /// [`Signer::sign`].
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Token cancelling every signing started through [`Signer::sign`].
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns the full argument list passed to the program.
    pub fn arguments(&self, bundle: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.launcher_args.iter().map(OsString::from).collect();
        for arg in ["smime", "-sign", "-signer"] {
            args.push(arg.into());
        }
        args.push(bundle.as_os_str().to_os_string());
        args.push("-inkey".into());
        args.push(bundle.as_os_str().to_os_string());
        for arg in ["-outform", "pem", "-nodetach"] {
            args.push(arg.into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// Signs `body` with the bundle, aborting when `cancel` fires.
    ///
    /// The body is written to the process while its output and diagnostics
    /// are drained, so large messages cannot stall on full pipe buffers.
    pub async fn sign_with_cancel(
        &self,
        body: &[u8],
        bundle: &Path,
        cancel: &CancellationToken,
    ) -> SignResult<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(self.arguments(bundle))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!(
                    program = %self.program,
                    error = %source,
                    "Failed to launch signing process"
                );
                SignError::Launch {
                    program: self.program.clone(),
                    source,
                }
            })?;
        debug!(
            program = %self.program,
            pid = ?child.id(),
            bundle = %bundle.display(),
            bytes = body.len(),
            "Launched signing process"
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = {
            let exchange = async {
                let (written, output, diagnostics) = tokio::join!(
                    feed(stdin, body),
                    drain(stdout, self.max_output),
                    drain(stderr, MAX_DIAGNOSTICS)
                );
                let status = child.wait().await;
                (written, output, diagnostics, status)
            };
            let deadline = async {
                match self.timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                result = exchange => Ok(result),
                _ = deadline => Err(SignError::Timeout(self.timeout.unwrap_or_default())),
                _ = cancel.cancelled() => Err(SignError::Cancelled),
            }
        };

        let (written, output, diagnostics, status) = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Killing signing process");
                if let Err(kill_error) = child.kill().await {
                    debug!(error = %kill_error, "Failed to kill signing process");
                }
                return Err(e);
            }
        };

        let status = status.map_err(SignError::Io)?;
        let diagnostics = diagnostics
            .map(|captured| String::from_utf8_lossy(&captured.bytes).trim_end().to_string())
            .unwrap_or_default();

        // A process failing early also breaks the input pipe, its own
        // diagnostics are the error worth reporting
        if !status.success() {
            error!(
                program = %self.program,
                code = ?status.code(),
                stderr = %diagnostics,
                "Signing process failed"
            );
            return Err(SignError::Process {
                code: status.code(),
                stderr: diagnostics,
            });
        }
        // Exit status 0 alone decides success, the process may stop
        // reading its input early
        if let Err(e) = written {
            warn!(
                program = %self.program,
                error = %e,
                "Signing process did not read the whole message"
            );
        }

        let output = output.map_err(SignError::Io)?;
        if output.overflowed {
            error!(limit = self.max_output, "Signed output exceeds limit");
            return Err(SignError::OutputTooLarge {
                limit: self.max_output,
            });
        }
        if output.bytes.is_empty() {
            return Err(SignError::EmptyOutput);
        }

        debug!(
            bytes_in = body.len(),
            bytes_out = output.bytes.len(),
            "Signing process completed"
        );
        Ok(output.bytes)
    }
}

impl Default for OpensslSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for OpensslSigner {
    fn sign<'a>(&'a self, body: &'a [u8], bundle: &'a Path) -> SignFuture<'a> {
        Box::pin(self.sign_with_cancel(body, bundle, &self.shutdown))
    }

    fn name(&self) -> &str {
        "openssl"
    }
}

/// Writes the whole body to the process input and closes it, signaling
/// the end of the message.
async fn feed(stdin: Option<ChildStdin>, body: &[u8]) -> io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    stdin.write_all(body).await?;
    stdin.flush().await?;
    drop(stdin);
    Ok(())
}

/// Bytes read from a process stream, bounded by a limit.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

/// Reads the stream to its end, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the writing process never blocks.
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> io::Result<Captured> {
    let mut captured = Captured::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut buffer = [0u8; 8192];
    loop {
        let count = reader.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if count > room {
            captured.overflowed = true;
        }
        captured.bytes.extend_from_slice(&buffer[..count.min(room)]);
    }
    Ok(captured)
}
