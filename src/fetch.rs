//! Source fetching with checksum verification.
//!
//! Downloads land in a local cache and are verified against the recipe's
//! SHA-256 digest before any lifecycle phase runs. A cached file whose digest
//! no longer matches is deleted and fetched again; a fresh download that
//! still mismatches is a hard [`MashError::ChecksumMismatch`].

use crate::error::{MashError, Result};
use crate::recipe::Recipe;
use anyhow::Context;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Source download cache (`~/.cache/mash/sources` or XDG equivalent).
pub fn cache_dir() -> PathBuf {
    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("mash/sources")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/mash/sources")
    } else {
        PathBuf::from(".cache/mash/sources")
    }
}

/// Streaming SHA-256 of a file.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Ensure a recipe's source archive is present in the cache, downloading it
/// when missing. A cached file whose digest no longer matches is deleted and
/// fetched again; enforcement of the digest itself is [`verify_source`].
pub async fn ensure_fetched(
    recipe: &Recipe,
    client: &reqwest::Client,
    cache: &Path,
    progress: Option<&MultiProgress>,
) -> Result<PathBuf> {
    fs::create_dir_all(cache)
        .await
        .context("Failed to create source cache directory")?;

    let filename = format!("{}--{}.tar.gz", recipe.name, recipe.pkg_version());
    let output_path = cache.join(&filename);

    // Cached and still matching: nothing to do. Stale cache is refetched.
    if output_path.exists() {
        if file_sha256(&output_path).await? == recipe.source.sha256 {
            return Ok(output_path);
        }
        fs::remove_file(&output_path).await?;
    }

    download(recipe, client, &output_path, progress).await?;
    Ok(output_path)
}

/// Digest gate for a fetched archive. A mismatch deletes the file so the
/// next run refetches it.
pub async fn verify_source(recipe: &Recipe, archive: &Path) -> Result<()> {
    let actual = file_sha256(archive).await?;
    if actual != recipe.source.sha256 {
        fs::remove_file(archive).await?;
        return Err(MashError::ChecksumMismatch {
            recipe: recipe.name.clone(),
            expected: recipe.source.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

/// Fetch a recipe's source archive into the cache and verify its digest.
///
/// Returns the path to the verified archive. The recipe never proceeds past
/// verification with a bad digest.
pub async fn fetch_source(
    recipe: &Recipe,
    client: &reqwest::Client,
    cache: &Path,
    progress: Option<&MultiProgress>,
) -> Result<PathBuf> {
    let archive = ensure_fetched(recipe, client, cache, progress).await?;
    verify_source(recipe, &archive).await?;
    Ok(archive)
}

async fn download(
    recipe: &Recipe,
    client: &reqwest::Client,
    output_path: &Path,
    progress: Option<&MultiProgress>,
) -> Result<()> {
    let url = &recipe.source.url;

    // Local sources (file://) are copied straight into the cache; they still
    // go through the same digest gate as remote archives.
    if let Some(local) = url.strip_prefix("file://") {
        fs::copy(local, output_path)
            .await
            .map_err(|e| MashError::Fetch {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        return Ok(());
    }

    let pb = progress.map(|mp| {
        let pb = mp.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("fetch {}", recipe.name));
        pb
    });

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| MashError::Fetch {
            url: url.clone(),
            reason: e.to_string(),
        })?;

    if let (Some(pb), Some(total)) = (&pb, response.content_length()) {
        pb.set_length(total);
    }

    let mut file = fs::File::create(output_path)
        .await
        .context("Failed to create cache file")?;
    let mut downloaded: u64 = 0;

    while let Some(chunk) = response.chunk().await.map_err(|e| MashError::Fetch {
        url: url.clone(),
        reason: e.to_string(),
    })? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if let Some(pb) = &pb {
            pb.set_position(downloaded);
        }
    }

    file.flush().await?;

    if let Some(pb) = &pb {
        pb.finish_with_message(format!("done {}", recipe.name));
    }

    Ok(())
}
