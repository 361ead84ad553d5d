use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Method, StatusCode};
use vmgate_server::auth::{compute_signature, API_KEY_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use vmgate_server::runner::is_safe_vm_name;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "vmgate",
    about = "Signed client for the vmgated remote VM control API",
    version
)]
struct Cli {
    /// Base URL of the vmgated server
    #[arg(long, env = "VMGATE_URL", default_value = "http://127.0.0.1:8000", global = true)]
    url: String,
    /// Shared API key
    #[arg(long, env = "API_KEY", hide_env_values = true, default_value = "", global = true)]
    api_key: String,
    /// Shared HMAC secret
    #[arg(long, env = "HMAC_SECRET", hide_env_values = true, default_value = "", global = true)]
    hmac_secret: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server and its VM tool respond
    Health,
    /// List VMs on the host
    List,
    /// Start a VM
    Start { name: String },
    /// Shut a VM down
    Shutdown { name: String },
    /// Restart a VM
    Restart { name: String },
    /// Print the authentication headers for a body, without sending anything
    Sign {
        #[arg(long, default_value = "")]
        body: String,
        /// Unix seconds or RFC 3339; defaults to now
        #[arg(long)]
        timestamp: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let client = Client {
        http: reqwest::Client::new(),
        base: cli.url.trim_end_matches('/').to_owned(),
        api_key: cli.api_key,
        secret: cli.hmac_secret,
    };

    match cli.command {
        Commands::Health => client.send(Method::GET, "/health", false).await,
        Commands::List => client.send(Method::GET, "/vm/list", true).await,
        Commands::Start { name } => client.send(Method::POST, &vm_path(&name, "start")?, true).await,
        Commands::Shutdown { name } => {
            client.send(Method::POST, &vm_path(&name, "shutdown")?, true).await
        }
        Commands::Restart { name } => {
            client.send(Method::POST, &vm_path(&name, "restart")?, true).await
        }
        Commands::Sign { body, timestamp } => {
            let ts = timestamp.unwrap_or_else(now);
            for (name, value) in client.auth_headers(body.as_bytes(), &ts) {
                println!("{name}: {value}");
            }
            Ok(())
        }
    }
}

struct Client {
    http: reqwest::Client,
    base: String,
    api_key: String,
    secret: String,
}

impl Client {
    fn auth_headers(&self, body: &[u8], ts: &str) -> [(&'static str, String); 3] {
        [
            (API_KEY_HEADER, self.api_key.clone()),
            (SIGNATURE_HEADER, compute_signature(self.secret.as_bytes(), body, ts)),
            (TIMESTAMP_HEADER, ts.to_owned()),
        ]
    }

    async fn send(&self, method: Method, path: &str, signed: bool) -> Result<()> {
        let mut req = self.http.request(method, format!("{}{path}", self.base));
        if signed {
            if self.api_key.is_empty() || self.secret.is_empty() {
                bail!("API_KEY and HMAC_SECRET must be set for signed requests");
            }
            for (name, value) in self.auth_headers(b"", &now()) {
                req = req.header(name, value);
            }
        }

        let resp = req.send().await.context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        println!("{}", serde_json::to_string_pretty(&body)?);

        if status != StatusCode::OK {
            bail!("server returned {status}");
        }
        Ok(())
    }
}

fn now() -> String {
    chrono::Utc::now().timestamp().to_string()
}

/// Refuses names the server would reject, then percent-encodes spaces, the
/// only character a valid name may contain that a path segment may not.
fn vm_path(name: &str, action: &str) -> Result<String> {
    if !is_safe_vm_name(name) {
        bail!("invalid VM name {name:?}");
    }
    Ok(format!("/vm/{}/{action}", name.replace(' ', "%20")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_spaces_in_vm_names() {
        assert_eq!(vm_path("My VM", "start").unwrap(), "/vm/My%20VM/start");
        assert_eq!(vm_path("TestVM", "restart").unwrap(), "/vm/TestVM/restart");
    }

    #[test]
    fn refuses_names_that_would_escape_the_route() {
        for name in [".", "..", "../start", "a/b", ""] {
            assert!(vm_path(name, "start").is_err(), "{name:?}");
        }
    }

    #[test]
    fn headers_match_server_signature() {
        let client = Client {
            http: reqwest::Client::new(),
            base: String::new(),
            api_key: "key".into(),
            secret: "secret".into(),
        };
        let headers = client.auth_headers(b"", "1748779200");
        assert_eq!(headers[0], ("x-api-key", "key".to_owned()));
        assert_eq!(headers[1].1, compute_signature(b"secret", b"", "1748779200"));
        assert_eq!(headers[2], ("x-timestamp", "1748779200".to_owned()));
    }
}
