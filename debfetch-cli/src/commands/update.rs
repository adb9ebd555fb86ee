//! Update command - refresh release files and package indexes.

use std::fs;
use std::path::PathBuf;

use debfetch::uri::Uri;
use debfetch::{IndexTarget, ReleaseSource, RunResult};
use tracing::{info, warn};

use crate::error::CliError;
use crate::runner::{CliRunner, GlobalOptions};

/// Arguments for the update command.
pub struct UpdateArgs {
    /// One-line sources entries, `deb URI DIST COMPONENT...`.
    pub sources: Vec<String>,
    pub sources_file: Option<PathBuf>,
    pub arch: String,
    /// Translation languages to fetch alongside the package lists.
    pub languages: Vec<String>,
    pub no_inrelease: bool,
}

/// Run the update command.
pub fn run(options: &GlobalOptions, args: UpdateArgs) -> Result<RunResult, CliError> {
    let sources = collect_sources(&args)?;

    let runner = CliRunner::new(options)?;
    let mut acquire = runner.engine()?;
    for source in &sources {
        info!(release = %source.release.uri, targets = source.targets.len(), "adding release");
        acquire.add_release(source);
    }

    let result = runner.run(&mut acquire)?;
    if result == RunResult::Continue {
        let lists = runner.config().lists_dir.clone();
        match acquire.clean(&lists) {
            Ok(removed) if removed > 0 => info!(removed, dir = %lists.display(), "removed stale lists"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to clean lists"),
        }
    }
    runner.report(result, acquire.summary())?;
    Ok(result)
}

/// Sources from `--source` and the sources file, in that order.
pub fn collect_sources(args: &UpdateArgs) -> Result<Vec<ReleaseSource>, CliError> {
    let mut lines = args.sources.clone();
    if let Some(path) = &args.sources_file {
        let text = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        lines.extend(text.lines().map(str::to_string));
    }

    let mut sources = Vec::new();
    for line in &lines {
        if let Some(source) = parse_source_line(line, &args.arch, &args.languages)? {
            sources.push(if args.no_inrelease {
                source.without_inrelease()
            } else {
                source
            });
        }
    }
    if sources.is_empty() {
        return Err(CliError::Config(
            "no sources given; use --source or --sources-file".to_string(),
        ));
    }
    Ok(sources)
}

/// Parse one sources line. Comments, blank lines and `deb-src` entries yield `None`.
pub fn parse_source_line(
    line: &str,
    arch: &str,
    languages: &[String],
) -> Result<Option<ReleaseSource>, CliError> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(None);
    }
    let malformed = |reason: &str| CliError::Source {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let mut words = line.split_whitespace().peekable();
    match words.next() {
        Some("deb") => {}
        Some("deb-src") => return Ok(None),
        _ => return Err(malformed("expected 'deb'")),
    }
    // [arch=... signed-by=...]
    if words.peek().is_some_and(|w| w.starts_with('[')) {
        for word in words.by_ref() {
            if word.ends_with(']') {
                break;
            }
        }
    }

    let uri = words.next().ok_or_else(|| malformed("missing URI"))?;
    let dist = words.next().ok_or_else(|| malformed("missing distribution"))?;
    let components: Vec<&str> = words.collect();

    let base = if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{}/", uri)
    };
    let site = Uri::parse(&base)
        .map(|u| u.host)
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| base.clone());

    // "dist/" names a flat repository without components
    if dist.ends_with('/') {
        if !components.is_empty() {
            return Err(malformed("a flat repository takes no components"));
        }
        return Err(malformed("flat repositories are not supported"));
    }
    if components.is_empty() {
        return Err(malformed("missing components"));
    }

    let mut source = ReleaseSource::for_dist(&base, dist, &site);
    for component in components {
        let key = format!("{}/binary-{}/Packages", component, arch);
        source = source.with_target(IndexTarget::new(
            format!("{}dists/{}/{}", base, dist, key),
            format!("{} {}/{} {} Packages", site, dist, component, arch),
            "Packages",
            key,
        ));
        for lang in languages {
            let key = format!("{}/i18n/Translation-{}", component, lang);
            source = source.with_target(
                IndexTarget::new(
                    format!("{}dists/{}/{}", base, dist, key),
                    format!("{} {}/{} Translation-{}", site, dist, component, lang),
                    format!("Translation-{}", lang),
                    key,
                )
                .optional(),
            );
        }
    }
    Ok(Some(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(sources: &[&str], sources_file: Option<PathBuf>) -> UpdateArgs {
        UpdateArgs {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            sources_file,
            arch: "amd64".to_string(),
            languages: Vec::new(),
            no_inrelease: false,
        }
    }

    #[test]
    fn test_collect_sources_reads_file_after_flags() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("sources.list");
        fs::write(
            &path,
            "# mirrors\ndeb http://a.example.org/debian sid main\n\ndeb-src http://a.example.org/debian sid main\n",
        )
        .unwrap();

        let sources = collect_sources(&args(&["deb http://b.example.org/debian bookworm main"], Some(path))).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].dist, "bookworm");
        assert_eq!(sources[1].dist, "sid");
    }

    #[test]
    fn test_collect_sources_without_inrelease() {
        let mut update = args(&["deb http://a.example.org/debian sid main"], None);
        update.no_inrelease = true;
        let sources = collect_sources(&update).unwrap();
        assert!(sources[0].inrelease.is_none());
    }

    #[test]
    fn test_collect_sources_errors() {
        assert!(matches!(collect_sources(&args(&[], None)), Err(CliError::Config(_))));

        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("missing.list");
        assert!(matches!(
            collect_sources(&args(&[], Some(missing))),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_parse_basic_line() {
        let source = parse_source_line("deb http://deb.debian.org/debian sid main contrib", "amd64", &[])
            .unwrap()
            .unwrap();
        assert_eq!(source.dist, "sid");
        assert_eq!(
            source.inrelease.unwrap().uri,
            "http://deb.debian.org/debian/dists/sid/InRelease"
        );
        assert_eq!(source.targets.len(), 2);
        assert_eq!(source.targets[1].meta_key, "contrib/binary-amd64/Packages");
        assert_eq!(
            source.targets[0].uri,
            "http://deb.debian.org/debian/dists/sid/main/binary-amd64/Packages"
        );
        assert_eq!(
            source.targets[0].description,
            "deb.debian.org sid/main amd64 Packages"
        );
    }

    #[test]
    fn test_parse_options_and_translations() {
        let langs = vec!["en".to_string()];
        let source = parse_source_line(
            "deb [arch=amd64 signed-by=/usr/share/keyrings/k.gpg] http://h/d/ bookworm main",
            "arm64",
            &langs,
        )
        .unwrap()
        .unwrap();
        assert_eq!(source.targets.len(), 2);
        assert_eq!(source.targets[0].meta_key, "main/binary-arm64/Packages");
        assert!(source.targets[1].optional);
        assert_eq!(source.targets[1].short_desc, "Translation-en");
    }

    #[test]
    fn test_parse_skips_comments_and_sources() {
        assert!(parse_source_line("# deb http://h/ sid main", "amd64", &[]).unwrap().is_none());
        assert!(parse_source_line("   ", "amd64", &[]).unwrap().is_none());
        assert!(parse_source_line("deb-src http://h/ sid main", "amd64", &[]).unwrap().is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_source_line("rpm http://h/ sid main", "amd64", &[]),
            Err(CliError::Source { .. })
        ));
        assert!(parse_source_line("deb http://h/", "amd64", &[]).is_err());
        assert!(parse_source_line("deb http://h/ sid", "amd64", &[]).is_err());
        assert!(parse_source_line("deb http://h/ ./", "amd64", &[]).is_err());
    }
}
