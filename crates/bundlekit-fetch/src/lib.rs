mod client;
mod download;
mod manifest_source;
mod retry;

pub use client::build_http_client;
pub use download::{
    discard_stale_partials, FetchClient, FetchRequest, FetchedFile, PartialDownload,
    ProgressObserver,
};
pub use manifest_source::{ManifestLoad, ManifestSource};
pub use retry::{run_with_retry, RetryPolicy};
