//! Bearer-token storage for the daemon.
//!
//! The token is 32 cryptographically random bytes, base64url-encoded to 43
//! characters, kept at `<home>/token` with owner-only permissions.

use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

pub const TOKEN_LEN: usize = 43;

pub fn token_path(home: &Path) -> PathBuf {
    home.join("token")
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Read the stored token, creating one on first use.
pub fn load_or_create(home: &Path) -> std::io::Result<String> {
    let path = token_path(home);
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(contents.trim().to_string()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => rotate(home),
        Err(err) => Err(err),
    }
}

/// Replace the stored token with a fresh one.
pub fn rotate(home: &Path) -> std::io::Result<String> {
    let token = generate_token();
    write_token(home, &token)?;
    Ok(token)
}

fn write_token(home: &Path, token: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(home)?;
    let path = token_path(home);
    std::fs::write(&path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
