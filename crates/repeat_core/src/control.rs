//! Daemon control socket.
//!
//! A unix socket in the config directory accepts line commands; `shutdown`
//! finalizes the mount and stops the server. The CLI's `shutdown` subcommand
//! is a thin client of this socket.

use crate::engine::Engine;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SOCKET_NAME: &str = "control.sock";

pub struct ControlServer {
    path: PathBuf,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ControlServer {
    pub fn socket_path(config_dir: &Path) -> PathBuf {
        config_dir.join(SOCKET_NAME)
    }

    /// Bind the socket and serve commands on a background thread until a
    /// `shutdown` arrives.
    pub fn start(engine: Arc<Engine>, config_dir: &Path) -> std::io::Result<Self> {
        let path = Self::socket_path(config_dir);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!("control socket at {}", path.display());

        let socket_path = path.clone();
        let thread = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("control accept failed: {e}");
                        continue;
                    }
                };
                if handle_client(stream, &engine) {
                    break;
                }
            }
            std::fs::remove_file(&socket_path).ok();
        });

        Ok(Self {
            path,
            thread: Some(thread),
        })
    }

    /// Block until the server thread exits (after a shutdown command).
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns true when the server should stop.
fn handle_client(stream: UnixStream, engine: &Arc<Engine>) -> bool {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line).is_err() {
        return false;
    }
    let mut stream = reader.into_inner();

    match line.trim() {
        "shutdown" => {
            engine.shutdown();
            stream.write_all(b"ok\n").ok();
            true
        }
        "ping" => {
            stream.write_all(b"pong\n").ok();
            false
        }
        other => {
            tracing::warn!("unknown control command '{other}'");
            stream.write_all(b"err unknown command\n").ok();
            false
        }
    }
}

/// Client side: ask a running mount to shut down.
pub fn send_shutdown(socket: &Path) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(b"shutdown\n")?;
    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    reader.read_line(&mut reply)?;
    Ok(reply.trim().to_string())
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::MountOptions;
    use tempfile::TempDir;

    #[test]
    fn shutdown_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("target");
        std::fs::create_dir_all(&root).expect("mkdir");
        let config_dir = tmp.path().join("conf");

        let engine = Engine::mount(
            &root,
            &tmp.path().join("mnt"),
            &config_dir,
            Config::default(),
            MountOptions::default(),
        )
        .expect("mount");

        let server = ControlServer::start(Arc::clone(&engine), &config_dir).expect("start");
        let socket = server.path().to_path_buf();

        let reply = send_shutdown(&socket).expect("send shutdown");
        assert_eq!(reply, "ok");
        server.wait();
        assert!(engine.is_stopping());
        assert!(!socket.exists(), "socket removed on exit");
    }
}
