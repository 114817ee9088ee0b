//! Performs the fetches the pipeline hands out.

use asset_pipeline::FetchRequest;
use log::{debug, warn};
use serde::Serialize;
use tokio::task::JoinSet;
use url::Url;

use crate::source::drain_url;

/// Result of one fetch, ready to report back to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub name: String,
    pub url: String,
    pub attempt: u32,
    pub bytes: usize,
    pub success: bool,
}

/// Fetches every request concurrently, resolving relative URLs against
/// `base`. Outcomes are returned in request order.
pub async fn fetch_all(base: &Url, requests: Vec<FetchRequest>) -> Vec<FetchOutcome> {
    let mut tasks = JoinSet::new();
    for (index, request) in requests.into_iter().enumerate() {
        let resolved = base.join(&request.url);
        tasks.spawn(async move {
            let result = match resolved {
                Ok(url) => drain_url(&url).await,
                Err(err) => Err(err.into()),
            };
            let (bytes, success) = match result {
                Ok(bytes) => {
                    debug!("Fetched {} ({bytes} bytes)", request.url);
                    (bytes, true)
                }
                Err(err) => {
                    warn!("Failed to load {}: {err}", request.name);
                    (0, false)
                }
            };
            (
                index,
                FetchOutcome {
                    name: request.name,
                    url: request.url,
                    attempt: request.attempt,
                    bytes,
                    success,
                },
            )
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!("Fetch task aborted: {err}"),
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Error, anyhow};
    use asset_pipeline::AssetKind;
    use std::fs;

    fn request(name: &str, url: &str) -> FetchRequest {
        FetchRequest {
            name: name.to_owned(),
            kind: AssetKind::Style,
            url: url.to_owned(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn relative_urls_resolve_against_the_page() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("css"))?;
        fs::write(dir.path().join("css/icons.min.css"), ".ri { display: inline-block }")?;
        let page = Url::from_file_path(dir.path().join("index.html"))
            .map_err(|()| anyhow!("bad path"))?;

        let outcomes = fetch_all(
            &page,
            vec![
                request("icons.min.css", "css/icons.min.css"),
                request("missing.css", "css/missing.css"),
            ],
        )
        .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].name, "icons.min.css");
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].bytes, 29);
        assert!(!outcomes[1].success);
        Ok(())
    }
}
