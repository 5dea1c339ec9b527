use rand::{Rng, distr::Alphanumeric};

// Public identifier extracted from the Host header of an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestedHost<'a> {
    // Host is a direct subdomain of the root domain.
    Subdomain(&'a str),
    // Any other host, matched against custom hostnames.
    Hostname(&'a str),
}

// Split the host of a public request into a candidate subdomain or hostname.
pub(crate) fn parse_host<'a>(host: &'a str, root_domain: &str) -> RequestedHost<'a> {
    match host
        .strip_suffix(root_domain)
        .and_then(|prefix| prefix.strip_suffix('.'))
    {
        Some(subdomain) if !subdomain.is_empty() && !subdomain.contains('.') => {
            RequestedHost::Subdomain(subdomain)
        }
        _ => RequestedHost::Hostname(host),
    }
}

// Whether the subdomain is a single valid DNS label.
pub(crate) fn is_valid_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .bytes()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-')
}

// Case-insensitive glob match, where `*` matches any sequence of characters (including none).
pub(crate) fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.as_bytes();
    let hostname = hostname.as_bytes();
    let (mut p, mut h) = (0, 0);
    // Position of the last `*` seen, and the hostname position it's currently matched up to.
    let mut backtrack: Option<(usize, usize)> = None;
    while h < hostname.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, h));
            p += 1;
        } else if p < pattern.len() && pattern[p].eq_ignore_ascii_case(&hostname[h]) {
            p += 1;
            h += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            h = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

// Whether some host would be matched by both patterns.
pub(crate) fn hostnames_overlap(first: &str, second: &str) -> bool {
    let (a, b) = (first.as_bytes(), second.as_bytes());
    let (n, m) = (a.len(), b.len());
    // overlap[i][j]: the suffixes a[i..] and b[j..] can match a common string.
    let mut overlap = vec![vec![false; m + 1]; n + 1];
    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            overlap[i][j] = if i == n && j == m {
                true
            } else if i < n && a[i] == b'*' {
                overlap[i + 1][j] || (j < m && overlap[i][j + 1])
            } else if j < m && b[j] == b'*' {
                overlap[i][j + 1] || (i < n && overlap[i + 1][j])
            } else {
                i < n && j < m && a[i].eq_ignore_ascii_case(&b[j]) && overlap[i + 1][j + 1]
            };
        }
    }
    overlap[0][0]
}

// Generator for subdomains assigned to clients that didn't request one.
pub(crate) struct RandomSubdomains {
    length: usize,
}

impl RandomSubdomains {
    pub(crate) fn new(length: usize) -> Self {
        debug_assert!(length > 0);
        RandomSubdomains { length }
    }

    pub(crate) fn generate(&self) -> String {
        rand::rng()
            .sample_iter(Alphanumeric)
            .take(self.length)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect()
    }
}
