//! Mock hosted application binary for end-to-end harness tests
//!
//! Plays the role of the real server the harness drives: parses the
//! port/prefix flags the launcher passes, serves a minimal HTTP endpoint so
//! readiness probing is real, and registers step handlers covering every
//! outcome the protocol can carry.

use std::collections::HashMap;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use remotestep::common::logging;
use remotestep::remote::{self, AppContext, HostedApp};
use remotestep::{Result, StepError, StepRegistry, StepResolver};

/// Makes boot fail instead of serving, for startup-failure tests
const FAIL_BOOT: &str = "REMOTESTEP_MOCK_FAIL_BOOT";

/// Makes every HTTP response a 503 busy page, for readiness tests
const BUSY: &str = "REMOTESTEP_MOCK_BUSY";

#[derive(Parser)]
#[command(name = "mock-server", about = "Minimal hosted application for harness tests")]
struct Cli {
    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// URL path prefix to serve under
    #[arg(long, default_value = "/")]
    prefix: String,
}

#[tokio::main]
async fn main() {
    let _cli = Cli::parse();

    if !remote::is_remote_invocation() {
        eprintln!("mock-server only runs as a child of the remotestep harness");
        std::process::exit(2);
    }

    if let Ok(home) = remotestep::common::env::home_dir() {
        let _ = logging::init_remote(&home);
    }

    let resolver = StepResolver::new(app_registry()).with_fallback(test_registry());
    remote::run(resolver, boot).await;
}

/// Steps the "application" itself would ship
fn app_registry() -> StepRegistry {
    let mut registry = StepRegistry::new("mock-app");

    registry.register("echo", |_, args| async move { Ok(Some(args)) });

    registry.register("identity", |app, _| async move {
        Ok(Some(json!({
            "home": app.home().display().to_string(),
            "port": app.port(),
            "base_url": app.base_url(),
        })))
    });

    registry.register("capability", |app, args| async move {
        let name = args["name"].as_str().unwrap_or_default().to_string();
        Ok(Some(json!({
            "supported": app.supports(&name),
            "value": app.capability(&name),
        })))
    });

    registry.register("write_records", |app, args| async move {
        let count = args["count"].as_u64().unwrap_or(1);
        let dir = app.home().join("records");
        std::fs::create_dir_all(&dir).map_err(StepError::from)?;
        for i in 0..count {
            let path = dir.join(format!("record-{i}.json"));
            std::fs::write(&path, json!({"id": i}).to_string()).map_err(StepError::from)?;
        }
        Ok(Some(json!(count)))
    });

    registry.register("count_records", |app, _| async move {
        let dir = app.home().join("records");
        let count = match std::fs::read_dir(&dir) {
            Ok(entries) => entries.count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StepError::from(e)),
        };
        Ok(Some(json!(count)))
    });

    registry
}

/// Steps contributed by the "test side", resolved through the fallback chain
fn test_registry() -> StepRegistry {
    let mut registry = StepRegistry::new("mock-test");

    registry.register("boom", |_, args| async move {
        let message = args["message"].as_str().unwrap_or("boom").to_string();
        Err(StepError::failed(message))
    });

    registry.register("chained_failure", |_, _| async move {
        let err = IndexError {
            source: std::io::Error::other("disk offline"),
        };
        Err(StepError::from(err))
    });

    registry.register("panic_with", |_, args| async move {
        let message = args["message"].as_str().unwrap_or("panicked").to_string();
        panic!("{}", message);
    });

    registry.register("skip_unless", |_, args| async move {
        if args["present"].as_bool().unwrap_or(false) {
            Ok(None)
        } else {
            Err(StepError::assumption("required fixture not present"))
        }
    });

    registry.register("sleep", |_, args| async move {
        let secs = args["secs"].as_u64().unwrap_or(1);
        tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        Ok(None)
    });

    registry.register("exit_with", |_, args| async move {
        let code = args["code"].as_i64().unwrap_or(1) as i32;
        // Simulates the process dying mid-step; no outcome file is written
        std::process::exit(code);
    });

    registry
}

#[derive(Debug, thiserror::Error)]
#[error("records index unreadable")]
struct IndexError {
    #[source]
    source: std::io::Error,
}

struct MockApp {
    base_url: String,
    accept_task: JoinHandle<()>,
}

#[async_trait]
impl HostedApp for MockApp {
    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn capabilities(&self) -> HashMap<String, String> {
        let mut capabilities = HashMap::new();
        capabilities.insert("records".to_string(), "v1".to_string());
        capabilities
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        self.accept_task.abort();
        Ok(())
    }
}

async fn boot(context: AppContext) -> Result<Box<dyn HostedApp>> {
    if std::env::var(FAIL_BOOT).is_ok() {
        return Err(remotestep::Error::Config(
            "mock application refused to boot".to_string(),
        ));
    }

    let busy = std::env::var(BUSY).is_ok();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", context.port)).await?;
    let accept_task = tokio::spawn(serve(listener, busy));

    let prefix = if context.prefix == "/" {
        "/".to_string()
    } else {
        format!("/{}/", context.prefix.trim_matches('/'))
    };

    Ok(Box::new(MockApp {
        base_url: format!("http://127.0.0.1:{}{}", context.port, prefix),
        accept_task,
    }))
}

async fn serve(listener: tokio::net::TcpListener, busy: bool) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            break;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = if busy {
                "HTTP/1.1 503 Service Unavailable\r\ncontent-type: text/plain\r\ncontent-length: 24\r\nconnection: close\r\n\r\nserver busy, please wait"
            } else {
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
            };
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
