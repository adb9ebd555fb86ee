//! Fetch command - download single files by URI.

use std::path::{Path, PathBuf};

use debfetch::uri::Uri;
use debfetch::{FileRequest, HashString, RunResult};
use tracing::info;

use crate::error::CliError;
use crate::runner::{CliRunner, GlobalOptions};

/// Arguments for the fetch command.
pub struct FetchArgs {
    pub uris: Vec<String>,
    pub dest: PathBuf,
    /// Expected digest as `TYPE:HEX`, applied to every URI.
    pub hash: Option<String>,
    pub size: Option<u64>,
}

/// Run the fetch command.
pub fn run(options: &GlobalOptions, args: FetchArgs) -> Result<RunResult, CliError> {
    let hash = match &args.hash {
        Some(text) => {
            let hash = HashString::parse(text);
            if hash.hash_type().is_none() {
                return Err(CliError::Config(format!("unknown hash '{}'", text)));
            }
            hash
        }
        None => HashString::default(),
    };

    let runner = CliRunner::new(options)?;
    let mut acquire = runner.engine()?;
    for uri in &args.uris {
        let request = file_request(uri, &args.dest, &hash, args.size)?;
        info!(uri = %request.uri, dest = %args.dest.display(), "adding file");
        acquire.add_file(request);
    }

    let result = runner.run(&mut acquire)?;
    runner.report(result, acquire.summary())?;
    Ok(result)
}

fn file_request(
    uri: &str,
    dest: &Path,
    hash: &HashString,
    size: Option<u64>,
) -> Result<FileRequest, CliError> {
    let parsed = Uri::parse(uri)?;
    let name = parsed
        .path
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CliError::Config(format!("'{}' does not name a file", uri)))?;

    let mut request = FileRequest::new(uri, uri)
        .with_hash(hash.clone())
        .with_dest_filename(dest.join(name));
    request.short_desc = name.to_string();
    if let Some(size) = size {
        request = request.with_size(size);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_request_uses_last_path_segment() {
        let request = file_request(
            "http://example.org/pool/main/f/foo_1.0.dsc",
            &PathBuf::from("/tmp/out"),
            &HashString::default(),
            Some(42),
        )
        .unwrap();
        assert_eq!(request.dest_filename, Some(PathBuf::from("/tmp/out/foo_1.0.dsc")));
        assert_eq!(request.short_desc, "foo_1.0.dsc");
        assert_eq!(request.size, 42);
    }

    #[test]
    fn test_file_request_rejects_directory() {
        assert!(file_request(
            "http://example.org/pool/",
            &PathBuf::from("."),
            &HashString::default(),
            None
        )
        .is_err());
    }
}
