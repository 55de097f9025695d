use std::{
    io,
    process::ExitStatus,
    sync::{Arc, PoisonError, RwLock},
};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum CmdError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("{cmd} {args} exited with {status}: {stderr}")]
    Failed {
        cmd: String,
        args: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Runs `cmd` to completion and returns its trimmed stdout.
pub async fn run_cmd(cmd: &str, args: &[&str]) -> Result<String, CmdError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .map_err(|source| CmdError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CmdError::Failed {
            cmd: cmd.to_string(),
            args: args.join(" "),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Shared, lock protected value. A panic while the lock was held does not
/// make the value unreachable.
pub struct State<T> {
    state: Arc<RwLock<T>>,
}

impl<T> State<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&T) -> K,
    {
        let value = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&value)
    }

    pub fn write<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&mut T) -> K,
    {
        let mut value = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut value)
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}
