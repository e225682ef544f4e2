use thiserror::Error;

use crate::command::{CommandOps, Error as CommandError, Verbosity};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate an OpenVPN static secret.
///
/// `openvpn --genkey` only writes to a file, so the key takes a round trip
/// through a scratch file that is removed when this returns.
pub fn generate(ops: &impl CommandOps) -> Result<String, Error> {
    let scratch = tempfile::NamedTempFile::new()?;
    let path = scratch.path().to_string_lossy().into_owned();
    ops.run(&["openvpn", "--genkey", "--secret", &path], Verbosity::Debug)?;
    let key = std::fs::read_to_string(scratch.path())?;
    Ok(key)
}
