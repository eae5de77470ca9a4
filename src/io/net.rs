use crate::error::Result;
use reqwest::blocking::Client;
use std::{
    fs,
    io::{Read, Write},
    path::Path,
    time::Duration,
};
use tracing::debug;

pub fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .user_agent(concat!("stem-analyzer-core/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(15))
        .build()?)
}

/// Streams `url` into `dest` through a temporary file in the same directory.
pub fn download_with_progress(client: &Client, url: &str, dest: &Path) -> Result<()> {
    let mut resp = client.get(url).send()?.error_for_status()?;
    let total = resp.content_length().unwrap_or(0);

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    let mut buf = vec![0u8; 256 * 1024];
    let mut done: u64 = 0;
    let mut last_pct = 0;
    loop {
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        tmp.write_all(&buf[..n])?;
        done += n as u64;
        if total > 0 {
            let pct = done * 100 / total;
            if pct >= last_pct + 10 {
                last_pct = pct;
                debug!(done, total, "model download {pct}%");
            }
        }
    }
    tmp.flush()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
