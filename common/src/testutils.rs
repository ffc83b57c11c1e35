//! Shared helpers for the library's unit tests.

/// Deterministic byte pattern. 251 is prime, so the pattern never lines up
/// with chunk or block boundaries and shifted copies are detectable.
#[cfg(test)]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Create a temp directory holding a source file filled with [`pattern`]
/// bytes. The directory guard must stay alive for the duration of the test.
#[cfg(test)]
pub fn setup_source(len: usize) -> anyhow::Result<(tempfile::TempDir, std::path::PathBuf, Vec<u8>)> {
    let tmp_dir = tempfile::tempdir()?;
    let src = tmp_dir.path().join("src");
    let data = pattern(len);
    std::fs::write(&src, &data)?;
    Ok((tmp_dir, src, data))
}
