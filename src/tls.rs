use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;

use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, ServerConfig, ServerConnection,
    StreamOwned,
};

use crate::multi_stream::Channel;

/// A server-side TLS connection over TCP, usable as a stream channel.
pub type TlsServerChannel = StreamOwned<ServerConnection, TcpStream>;

/// A client-side TLS connection over TCP, usable as a stream channel.
pub type TlsClientChannel = StreamOwned<ClientConnection, TcpStream>;

/// Builds a server TLS configuration.
///
/// With both paths given, loads a PEM certificate chain and a PKCS8 or RSA
/// private key. Without them a throwaway self-signed certificate for
/// `localhost` is generated, which pairs with the perf client's disabled
/// verification.
pub fn server_config(cert: Option<&Path>, key: Option<&Path>) -> io::Result<Arc<ServerConfig>> {
    let (chain, key) = match (cert, key) {
        (Some(cert), Some(key)) => (load_certs(cert)?, load_private_key(key)?),
        _ => self_signed()?,
    };
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> io::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificate found in file",
        ));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> io::Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let mut reader = BufReader::new(File::open(path)?);
    let keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    keys.into_iter().next().map(PrivateKey).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "no PKCS8 or RSA private key found in file",
        )
    })
}

fn self_signed() -> io::Result<(Vec<Certificate>, PrivateKey)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(io::Error::other)?;
    let der = cert.serialize_der().map_err(io::Error::other)?;
    let key = cert.serialize_private_key_der();
    Ok((vec![Certificate(der)], PrivateKey(key)))
}

/// Builds a client TLS configuration with certificate verification
/// disabled.
///
/// This tool benchmarks throughput against servers running throwaway
/// certificates; it is not a template for production TLS clients.
pub fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Wraps an accepted TCP connection in a server-side TLS stream.
pub fn accept(sock: TcpStream, config: Arc<ServerConfig>) -> io::Result<TlsServerChannel> {
    let conn = ServerConnection::new(config)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(StreamOwned::new(conn, sock))
}

/// Connects to `addr` and wraps the connection in a client-side TLS stream
/// presenting `host` as the server name.
pub fn connect(addr: &str, host: &str, config: Arc<ClientConfig>) -> io::Result<TlsClientChannel> {
    let sock = TcpStream::connect(addr)?;
    let name = rustls::ServerName::try_from(host)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let conn = ClientConnection::new(config, name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(StreamOwned::new(conn, sock))
}

impl Channel for TlsServerChannel {
    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.sock)?;
        }
        self.sock.shutdown(Shutdown::Both)
    }
}

impl Channel for TlsClientChannel {
    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.sock)?;
        }
        self.sock.shutdown(Shutdown::Both)
    }
}
