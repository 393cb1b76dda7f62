//! Host identity used to tag hardware diagnostics.

/// Name of the machine this process runs on.
///
/// Falls back to `$HOSTNAME`, then to `"unknown-host"`.
pub fn host_identity() -> String {
    hostname_from_libc()
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(unix)]
fn hostname_from_libc() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(not(unix))]
fn hostname_from_libc() -> Option<String> {
    None
}
