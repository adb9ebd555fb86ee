//! URI parsing and the URI-derived names used on disk.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{AcquireError, AcquireResult};

/// Characters quoted when turning a URI into a file name.
const FILE_NAME_BAD_CHARS: &str = "\\|{}[]<>\"^~_=!@#$%^&*";

/// A URI in the loose form used by transports: `access:[//[user[:pass]@]host[:port]]/path`.
///
/// Local pivots such as `gzip:/var/lib/apt/lists/partial/x` have no host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub access: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Uri {
    pub fn parse(s: &str) -> AcquireResult<Self> {
        let Some((access, rest)) = s.split_once(':') else {
            return Err(AcquireError::InvalidUri(s.to_string()));
        };
        if access.is_empty() {
            return Err(AcquireError::InvalidUri(s.to_string()));
        }

        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };
        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((u, p)) => (u.to_string(), p.to_string()),
                None => (info.to_string(), String::new()),
            },
            None => (String::new(), String::new()),
        };

        let (host, port) = split_port(hostport);

        Ok(Self {
            access: access.to_string(),
            user,
            password,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Scheme of a URI string without a full parse. Empty when there is none.
    pub fn access_of(s: &str) -> &str {
        s.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// `host[:port]path`, the part that identifies the resource on disk.
    fn site_path(&self) -> String {
        let mut out = String::new();
        if !self.host.is_empty() {
            out.push_str(&self.host);
            if self.port != 0 {
                out.push_str(&format!(":{}", self.port));
            }
        }
        if !self.path.is_empty() && !self.path.starts_with('/') {
            out.push('/');
        }
        out.push_str(&self.path);
        out
    }
}

fn split_port(hostport: &str) -> (String, u16) {
    if hostport.starts_with('[') {
        if let Some(end) = hostport.find(']') {
            let host = hostport[1..end].to_string();
            let port = hostport[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            return (host, port);
        }
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (hostport.to_string(), 0),
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.access)?;
        if !self.host.is_empty() {
            f.write_str("//")?;
            if !self.user.is_empty() {
                f.write_str(&self.user)?;
                if !self.password.is_empty() {
                    write!(f, ":{}", self.password)?;
                }
                f.write_str("@")?;
            }
            if self.host.contains(':') || self.host.contains('/') {
                write!(f, "[{}]", self.host)?;
            } else {
                f.write_str(&self.host)?;
            }
            if self.port != 0 {
                write!(f, ":{}", self.port)?;
            }
        }
        if !self.path.is_empty() && !self.path.starts_with('/') {
            f.write_str("/")?;
        }
        f.write_str(&self.path)
    }
}

/// Percent-quote every byte of `s` that is in `bad`, is `%`, or is not printable ASCII.
pub fn quote_string(s: &str, bad: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b <= 0x20 || b >= 0x7f || b == b'%' || bad.as_bytes().contains(&b) {
            out.push_str(&format!("%{:02x}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Flatten a URI into the file name used under the lists directory.
///
/// Credentials and the scheme are dropped, unsafe characters (including `_`)
/// are quoted, then every `/` becomes `_`.
pub fn uri_to_file_name(uri: &str) -> String {
    let site = match Uri::parse(uri) {
        Ok(parsed) => parsed.site_path(),
        Err(_) => uri.to_string(),
    };
    quote_string(&site, FILE_NAME_BAD_CHARS).replace('/', "_")
}

/// Last path component, the equivalent of `basename`.
pub fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Format a time as an RFC 1123 HTTP date.
pub fn time_rfc1123(time: SystemTime) -> String {
    let dt: DateTime<Utc> = time.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RFC 1123/2822 date as found in HTTP headers and Release files.
pub fn parse_rfc1123(s: &str) -> Option<SystemTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(SystemTime::from(dt.with_timezone(&Utc)));
    }
    let bare = s
        .strip_suffix("UTC")
        .or_else(|| s.strip_suffix("GMT"))
        .or_else(|| s.strip_suffix("+0000"))?
        .trim();
    let naive = NaiveDateTime::parse_from_str(bare, "%a, %d %b %Y %H:%M:%S").ok()?;
    let secs = naive.and_utc().timestamp();
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

/// Compact duration as shown to users: `7d 3h 42min 1s`.
pub fn time_to_str(secs: u64) -> String {
    let (days, hours, minutes, seconds) = (
        secs / 86400,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{}d {}h {}min {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}min {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}min {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_uri() {
        let uri = Uri::parse("http://user:pw@deb.example.org:8080/debian/dists/sid").unwrap();
        assert_eq!(uri.access, "http");
        assert_eq!(uri.user, "user");
        assert_eq!(uri.password, "pw");
        assert_eq!(uri.host, "deb.example.org");
        assert_eq!(uri.port, 8080);
        assert_eq!(uri.path, "/debian/dists/sid");
        assert_eq!(
            uri.to_string(),
            "http://user:pw@deb.example.org:8080/debian/dists/sid"
        );
    }

    #[test]
    fn test_parse_local_pivot_uri() {
        let uri = Uri::parse("gzip:/var/lib/apt/lists/partial/x").unwrap();
        assert_eq!(uri.access, "gzip");
        assert!(uri.host.is_empty());
        assert_eq!(uri.path, "/var/lib/apt/lists/partial/x");
        assert_eq!(uri.to_string(), "gzip:/var/lib/apt/lists/partial/x");
    }

    #[test]
    fn test_parse_without_scheme_fails() {
        assert!(Uri::parse("/just/a/path").is_err());
        assert!(Uri::parse(":nothing").is_err());
    }

    #[test]
    fn test_access_of() {
        assert_eq!(Uri::access_of("rred:/x"), "rred");
        assert_eq!(Uri::access_of("nothing"), "");
    }

    #[test]
    fn test_uri_to_file_name() {
        assert_eq!(
            uri_to_file_name("http://deb.debian.org/debian/dists/sid/InRelease"),
            "deb.debian.org_debian_dists_sid_InRelease"
        );
        assert_eq!(
            uri_to_file_name("http://u:p@h/debian/dists/sid/main/binary-amd64/Packages"),
            "h_debian_dists_sid_main_binary-amd64_Packages"
        );
        assert_eq!(uri_to_file_name("file:/srv/repo/a_b"), "_srv_repo_a%5fb");
        assert_eq!(uri_to_file_name("http://h:81/x"), "h:81_x");
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string("1:2.0~rc1", "_:"), "1%3a2.0~rc1");
        assert_eq!(quote_string("a b%", ""), "a%20b%25");
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("pool/main/f/foo/foo_1.0_all.deb"), "foo_1.0_all.deb");
        assert_eq!(file_name_of("plain"), "plain");
    }

    #[test]
    fn test_rfc1123_format_and_parse() {
        let t = UNIX_EPOCH + Duration::from_secs(784111777);
        let text = time_rfc1123(t);
        assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_rfc1123(&text), Some(t));
    }

    #[test]
    fn test_parse_release_style_date() {
        let t = parse_rfc1123("Sun, 06 Nov 1994 08:49:37 UTC").unwrap();
        assert_eq!(t, UNIX_EPOCH + Duration::from_secs(784111777));
        assert!(parse_rfc1123("yesterday").is_none());
    }

    #[test]
    fn test_time_to_str() {
        assert_eq!(time_to_str(42), "42s");
        assert_eq!(time_to_str(61), "1min 1s");
        assert_eq!(time_to_str(3600), "1h 0min 0s");
        assert_eq!(time_to_str(7 * 86400 + 3 * 3600 + 42 * 60 + 1), "7d 3h 42min 1s");
    }
}
