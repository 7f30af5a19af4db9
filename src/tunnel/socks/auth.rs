//! SOCKS5 method negotiation and RFC 1929 username/password check

use super::consts::*;
use super::SocksOptions;
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password,
}

impl AuthMethod {
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }
}

/// Credentials carried by the tunnel request force password auth
fn select_auth_method(methods: &[u8], options: &SocksOptions) -> Option<AuthMethod> {
    if options.auth_required() {
        methods
            .contains(&SOCKS5_AUTH_METHOD_PASSWORD)
            .then_some(AuthMethod::Password)
    } else {
        methods
            .contains(&SOCKS5_AUTH_METHOD_NONE)
            .then_some(AuthMethod::None)
    }
}

/// Negotiate the method and run the password exchange if it was chosen
pub async fn authenticate<S>(stream: &mut S, options: &SocksOptions) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    let (version, num_methods) = (buf[0], buf[1]);

    if version != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version: {}", version);
    }
    if num_methods == 0 {
        bail!("No authentication methods provided");
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    let selected = select_auth_method(&methods, options);
    stream
        .write_all(&[
            SOCKS5_VERSION,
            selected
                .map(AuthMethod::to_byte)
                .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
        ])
        .await?;
    stream.flush().await?;

    let method = match selected {
        Some(m) => m,
        None => bail!("No acceptable authentication method"),
    };
    if method == AuthMethod::Password {
        check_password(
            stream,
            options.username.as_deref().unwrap_or_default(),
            options.password.as_deref().unwrap_or_default(),
        )
        .await?;
    }
    Ok(method)
}

async fn read_field<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    let mut field = vec![0u8; len];
    stream.read_exact(&mut field).await?;
    Ok(field)
}

/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// ```
async fn check_password<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS5_AUTH_VERSION {
        send_auth_result(stream, AUTH_FAILURE).await?;
        bail!("Invalid auth version: {}", version);
    }
    let user = read_field(stream).await?;
    let pass = read_field(stream).await?;

    if user == username.as_bytes() && pass == password.as_bytes() {
        send_auth_result(stream, AUTH_SUCCESS).await?;
        debug!("Authentication successful for user: {}", username);
        Ok(())
    } else {
        send_auth_result(stream, AUTH_FAILURE).await?;
        bail!("Authentication failed for user: {}", String::from_utf8_lossy(&user));
    }
}

async fn send_auth_result<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_credentials() -> SocksOptions {
        SocksOptions {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_auth_method() {
        let open = SocksOptions::default();
        let both = [SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD];
        assert_eq!(select_auth_method(&both, &open), Some(AuthMethod::None));
        assert_eq!(select_auth_method(&[SOCKS5_AUTH_METHOD_PASSWORD], &open), None);

        let locked = with_credentials();
        assert_eq!(select_auth_method(&both, &locked), Some(AuthMethod::Password));
        assert_eq!(select_auth_method(&[SOCKS5_AUTH_METHOD_NONE], &locked), None);
    }

    #[tokio::test]
    async fn test_password_exchange() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let options = with_credentials();
        let task = tokio::spawn(async move { authenticate(&mut server, &options).await });

        client
            .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD])
            .await
            .unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD]);

        client
            .write_all(&[SOCKS5_AUTH_VERSION, 4, b'u', b's', b'e', b'r', 4, b'p', b'a', b's', b's'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [SOCKS5_AUTH_VERSION, AUTH_SUCCESS]);
        assert_eq!(task.await.unwrap().unwrap(), AuthMethod::Password);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let options = with_credentials();
        let task = tokio::spawn(async move { authenticate(&mut server, &options).await });

        client
            .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD])
            .await
            .unwrap();
        client
            .write_all(&[SOCKS5_AUTH_VERSION, 4, b'u', b's', b'e', b'r', 1, b'x'])
            .await
            .unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[3], AUTH_FAILURE);
        assert!(task.await.unwrap().is_err());
    }
}
