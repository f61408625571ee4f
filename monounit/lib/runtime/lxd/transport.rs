use std::{collections::BTreeMap, path::Path, process::Stdio};

use futures::StreamExt;
use reqwest::{Body, Certificate, Client, Identity, Method};
use serde::Deserialize;
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt, process::Command};
use tokio_util::io::ReaderStream;

use crate::{
    runtime::ExecOutput,
    utils::run_command,
    MonounitError, MonounitResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LXC_BIN: &str = "lxc";

/// LXD operation status code for a failed operation.
const OPERATION_FAILURE: u64 = 400;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How requests reach the LXD REST API.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Mutual TLS against `https://host:8443`, with the server certificate pinned.
    Https {
        /// Configured client.
        client: Client,

        /// Base URL without a trailing slash.
        base: String,
    },

    /// The local daemon's unix socket, reached through the `lxc` command line.
    Socket {
        /// Name of the `lxc` remote, usually `local`.
        remote: String,
    },
}

/// What kind of filesystem entry is written into a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.
    File,

    /// A symlink. The content is the link target.
    Symlink,

    /// A directory.
    Directory,
}

#[derive(Debug, Deserialize)]
struct LxdResponse {
    #[serde(rename = "type")]
    kind: String,

    #[serde(default)]
    metadata: Value,

    #[serde(default)]
    operation: String,

    #[serde(default)]
    error: String,

    #[serde(default)]
    error_code: u16,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Transport {
    /// Creates a TLS transport that authenticates with the client key pair and only accepts the
    /// pinned server certificate.
    pub fn https(
        url: &str,
        client_cert_pem: &str,
        client_key_pem: &str,
        server_cert_pem: &str,
    ) -> MonounitResult<Self> {
        let identity =
            Identity::from_pkcs8_pem(client_cert_pem.as_bytes(), client_key_pem.as_bytes())?;
        let server_cert = Certificate::from_pem(server_cert_pem.as_bytes())?;

        // Self-signed daemon certificates rarely carry the host name we dial.
        let client = Client::builder()
            .use_native_tls()
            .identity(identity)
            .add_root_certificate(server_cert)
            .tls_built_in_root_certs(false)
            .danger_accept_invalid_hostnames(true)
            .build()?;

        Ok(Transport::Https {
            client,
            base: url.trim_end_matches('/').to_string(),
        })
    }

    /// Creates a transport over the `lxc` command line for the given remote.
    pub fn socket(remote: impl Into<String>) -> Self {
        Transport::Socket {
            remote: remote.into(),
        }
    }

    /// Sends a JSON request and returns the response metadata.
    ///
    /// Background operations are waited for. Their final operation object is returned, so the
    /// result of e.g. a publish lives under `metadata`.
    pub async fn query(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> MonounitResult<Value> {
        match self {
            Transport::Https { client, base } => {
                let mut request = client.request(method, format!("{base}{path}"));
                if let Some(body) = body {
                    request = request.json(body);
                }
                let response: LxdResponse = request.send().await?.json().await?;
                resolve(client, base, response).await
            }
            Transport::Socket { remote } => {
                let mut args = vec![
                    "query".to_string(),
                    "--wait".to_string(),
                    "-X".to_string(),
                    method.to_string(),
                ];
                if let Some(body) = body {
                    args.push("-d".to_string());
                    args.push(serde_json::to_string(body)?);
                }
                args.push(format!("{remote}:{path}"));

                let out = run_command(LXC_BIN, &args).await.map_err(classify_cli_error)?;
                if out.is_empty() {
                    return Ok(Value::Null);
                }
                Ok(serde_json::from_str(&out)?)
            }
        }
    }

    /// Fetches a path as raw bytes.
    pub async fn get_raw(&self, path: &str) -> MonounitResult<Vec<u8>> {
        match self {
            Transport::Https { client, base } => {
                let response = client.get(format!("{base}{path}")).send().await?;
                if !response.status().is_success() {
                    return Err(status_error(response.status().as_u16(), path));
                }
                Ok(response.bytes().await?.to_vec())
            }
            Transport::Socket { remote } => {
                let out = run_command(LXC_BIN, ["query", "--raw", &format!("{remote}:{path}")])
                    .await
                    .map_err(classify_cli_error)?;
                Ok(out.into_bytes())
            }
        }
    }

    /// Runs a command inside a unit and captures its output and exit status.
    pub async fn exec(
        &self,
        unit: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<ExecOutput> {
        match self {
            Transport::Https { .. } => {
                let body = serde_json::json!({
                    "command": command,
                    "environment": env,
                    "wait-for-websocket": false,
                    "interactive": false,
                    "record-output": true,
                });
                let op = self
                    .query(
                        Method::POST,
                        &format!("/1.0/instances/{unit}/exec"),
                        Some(&body),
                    )
                    .await?;

                let metadata = &op["metadata"];
                let status = metadata["return"].as_i64().unwrap_or(-1) as i32;
                let stdout = self.read_log(&metadata["output"]["1"]).await?;
                let stderr = self.read_log(&metadata["output"]["2"]).await?;

                Ok(ExecOutput {
                    status,
                    stdout,
                    stderr,
                })
            }
            Transport::Socket { remote } => {
                let mut cmd = Command::new(LXC_BIN);
                cmd.arg("exec").arg(format!("{remote}:{unit}"));
                for (key, value) in env {
                    cmd.arg("--env").arg(format!("{key}={value}"));
                }
                cmd.arg("--")
                    .args(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());

                let output = cmd.output().await.map_err(|e| {
                    MonounitError::Connectivity(format!("failed to spawn {LXC_BIN}: {e}"))
                })?;

                Ok(ExecOutput {
                    status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
        }
    }

    /// Starts a command inside a unit and returns once the daemon has accepted it.
    pub async fn spawn(
        &self,
        unit: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> MonounitResult<()> {
        match self {
            Transport::Https { client, base } => {
                let body = serde_json::json!({
                    "command": command,
                    "environment": env,
                    "wait-for-websocket": false,
                    "interactive": false,
                    "record-output": false,
                });
                let response: LxdResponse = client
                    .post(format!("{base}/1.0/instances/{unit}/exec"))
                    .json(&body)
                    .send()
                    .await?
                    .json()
                    .await?;

                // The operation is left running; only a refused request is an error.
                if response.kind == "error" {
                    return Err(response_error(response.error_code, &response.error));
                }
                Ok(())
            }
            Transport::Socket { remote } => {
                let mut cmd = Command::new(LXC_BIN);
                cmd.arg("exec").arg(format!("{remote}:{unit}"));
                for (key, value) in env {
                    cmd.arg("--env").arg(format!("{key}={value}"));
                }
                cmd.arg("--")
                    .args(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());

                cmd.spawn().map_err(|e| {
                    MonounitError::Connectivity(format!("failed to spawn {LXC_BIN}: {e}"))
                })?;
                Ok(())
            }
        }
    }

    /// Writes one filesystem entry at `target` inside a unit.
    ///
    /// `local` is read for files. For symlinks the link target is written instead.
    pub async fn write_entry(
        &self,
        unit: &str,
        local: &Path,
        target: &str,
        kind: EntryKind,
    ) -> MonounitResult<()> {
        match self {
            Transport::Https { client, base } => {
                let (lxd_type, body) = match kind {
                    EntryKind::File => ("file", fs::read(local).await?),
                    EntryKind::Symlink => (
                        "symlink",
                        fs::read_link(local)
                            .await?
                            .to_string_lossy()
                            .as_bytes()
                            .to_vec(),
                    ),
                    EntryKind::Directory => ("directory", Vec::new()),
                };
                let mode = if kind == EntryKind::File { "0644" } else { "0755" };

                let response: LxdResponse = client
                    .post(format!("{base}/1.0/instances/{unit}/files"))
                    .query(&[("path", target)])
                    .header("X-LXD-type", lxd_type)
                    .header("X-LXD-mode", mode)
                    .header("X-LXD-uid", "0")
                    .header("X-LXD-gid", "0")
                    .header("X-LXD-write", "overwrite")
                    .body(body)
                    .send()
                    .await?
                    .json()
                    .await?;
                resolve(client, base, response).await?;
                Ok(())
            }
            Transport::Socket { remote } => {
                match kind {
                    EntryKind::Directory => {
                        run_command(
                            LXC_BIN,
                            ["exec", &format!("{remote}:{unit}"), "--", "mkdir", "-p", target],
                        )
                        .await
                        .map_err(classify_cli_error)?;
                    }
                    EntryKind::File | EntryKind::Symlink => {
                        let local = local.to_string_lossy();
                        run_command(
                            LXC_BIN,
                            [
                                "file",
                                "push",
                                "--create-dirs",
                                local.as_ref(),
                                &format!("{remote}:{unit}{target}"),
                            ],
                        )
                        .await
                        .map_err(classify_cli_error)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Streams an image archive to `dest`.
    pub async fn export_image(&self, fingerprint: &str, dest: &Path) -> MonounitResult<()> {
        match self {
            Transport::Https { client, base } => {
                let path = format!("/1.0/images/{fingerprint}/export");
                let response = client.get(format!("{base}{path}")).send().await?;
                if !response.status().is_success() {
                    return Err(status_error(response.status().as_u16(), &path));
                }

                let mut file = fs::File::create(dest).await?;
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    file.write_all(&chunk?).await?;
                }
                file.flush().await?;
                Ok(())
            }
            Transport::Socket { remote } => {
                let staging = tempfile::tempdir()?;
                let target = format!("{}/", staging.path().display());
                run_command(
                    LXC_BIN,
                    ["image", "export", &format!("{remote}:{fingerprint}"), &target],
                )
                .await
                .map_err(classify_cli_error)?;

                let mut entries = fs::read_dir(staging.path()).await?;
                let exported = entries.next_entry().await?.ok_or_else(|| {
                    MonounitError::Operation(format!("export of image {fingerprint} wrote nothing"))
                })?;
                if entries.next_entry().await?.is_some() {
                    return Err(MonounitError::Operation(format!(
                        "image {fingerprint} is a split image and cannot be exported as one archive"
                    )));
                }

                fs::copy(exported.path(), dest).await?;
                Ok(())
            }
        }
    }

    /// Imports an archive and returns the image fingerprint.
    pub async fn import_image(&self, archive: &Path) -> MonounitResult<String> {
        match self {
            Transport::Https { client, base } => {
                let file = fs::File::open(archive).await?;
                let response: LxdResponse = client
                    .post(format!("{base}/1.0/images"))
                    .header("Content-Type", "application/octet-stream")
                    .body(Body::wrap_stream(ReaderStream::new(file)))
                    .send()
                    .await?
                    .json()
                    .await?;
                let op = resolve(client, base, response).await?;

                op["metadata"]["fingerprint"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        MonounitError::Operation("image import returned no fingerprint".into())
                    })
            }
            Transport::Socket { remote } => {
                let archive = archive.to_string_lossy();
                let out = run_command(
                    LXC_BIN,
                    ["image", "import", archive.as_ref(), &format!("{remote}:")],
                )
                .await
                .map_err(classify_cli_error)?;

                // "Image imported with fingerprint: <fp>"
                out.rsplit(':')
                    .next()
                    .map(|fp| fp.trim().to_string())
                    .filter(|fp| !fp.is_empty())
                    .ok_or_else(|| {
                        MonounitError::Operation(format!("unexpected import output: {out}"))
                    })
            }
        }
    }

    async fn read_log(&self, path: &Value) -> MonounitResult<String> {
        match path.as_str() {
            Some(path) => Ok(String::from_utf8_lossy(&self.get_raw(path).await?).to_string()),
            None => Ok(String::new()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn resolve(client: &Client, base: &str, response: LxdResponse) -> MonounitResult<Value> {
    match response.kind.as_str() {
        "sync" => Ok(response.metadata),
        "async" => {
            let waited: LxdResponse = client
                .get(format!("{base}{}/wait", response.operation))
                .send()
                .await?
                .json()
                .await?;
            if waited.kind == "error" {
                return Err(response_error(waited.error_code, &waited.error));
            }
            check_operation(waited.metadata)
        }
        _ => Err(response_error(response.error_code, &response.error)),
    }
}

fn check_operation(operation: Value) -> MonounitResult<Value> {
    if operation["status_code"].as_u64() == Some(OPERATION_FAILURE) {
        let err = operation["err"].as_str().unwrap_or("operation failed");
        return Err(classify_message(err));
    }
    Ok(operation)
}

fn response_error(code: u16, message: &str) -> MonounitError {
    match code {
        404 => MonounitError::NotFound(message.to_string()),
        409 => MonounitError::Conflict(message.to_string()),
        _ => classify_message(message),
    }
}

fn status_error(code: u16, path: &str) -> MonounitError {
    response_error(code, &format!("request to {path} failed with status {code}"))
}

fn classify_message(message: &str) -> MonounitError {
    let lower = message.to_lowercase();
    if lower.contains("not found") {
        MonounitError::NotFound(message.to_string())
    } else if lower.contains("already exists") {
        MonounitError::Conflict(message.to_string())
    } else {
        MonounitError::Operation(message.to_string())
    }
}

fn classify_cli_error(error: MonounitError) -> MonounitError {
    match error {
        MonounitError::Operation(message) => classify_message(&message),
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
