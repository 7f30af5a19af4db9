//! Proxy selection carried in tunnel requests

/// How the responder reaches a requested target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyKind {
    /// Use the dialer's configured default proxy, if any
    Global,
    /// Dial the target directly
    #[default]
    Direct,
    /// HTTP CONNECT proxy
    Http,
    /// SOCKS5 proxy
    Socks,
    /// SOCKS5 first, HTTP CONNECT as fallback
    Plus,
    /// Listen for one inbound connection instead of dialing
    Accept,
}

impl ProxyKind {
    /// Wire letter
    pub fn letter(self) -> char {
        match self {
            ProxyKind::Global => 'G',
            ProxyKind::Direct => 'D',
            ProxyKind::Http => 'H',
            ProxyKind::Socks => 'S',
            ProxyKind::Plus => 'P',
            ProxyKind::Accept => 'A',
        }
    }

    /// Parse a wire letter
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.trim() {
            "G" => Some(ProxyKind::Global),
            "D" => Some(ProxyKind::Direct),
            "H" => Some(ProxyKind::Http),
            "S" => Some(ProxyKind::Socks),
            "P" => Some(ProxyKind::Plus),
            "A" => Some(ProxyKind::Accept),
            _ => None,
        }
    }
}

/// Proxy in front of a target
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    /// No proxy
    pub fn direct() -> Self {
        ProxySpec::default()
    }

    /// Whatever default proxy the responder's dialer is configured with
    pub fn global() -> Self {
        ProxySpec {
            kind: ProxyKind::Global,
            ..ProxySpec::default()
        }
    }

    /// Accept mode: the responder listens on the target address
    pub fn accept() -> Self {
        ProxySpec {
            kind: ProxyKind::Accept,
            ..ProxySpec::default()
        }
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        ProxySpec {
            kind: ProxyKind::Socks,
            host: host.into(),
            port,
            ..ProxySpec::default()
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        ProxySpec {
            kind: ProxyKind::Http,
            host: host.into(),
            port,
            ..ProxySpec::default()
        }
    }

    /// Attach credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn is_accept(&self) -> bool {
        self.kind == ProxyKind::Accept
    }
}
