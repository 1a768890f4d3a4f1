//! TLS context setup.
//!
//! The collaborator surface is deliberately narrow: build a server or client
//! context from the configured mode and credential paths, then wrap an
//! accepted or connected socket into a [`Stream`]. Bridge deployments use
//! self-signed certificates, so the client side does not verify the peer
//! chain; it still gets the confidentiality and integrity of the channel.

use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
	ClientConfig, ClientConnection, DigitallySignedStruct, ServerConfig, ServerConnection,
	SignatureScheme, StreamOwned, SupportedProtocolVersion,
};

use crate::config::Encryption;
use crate::errors::{Error, Result};
use crate::net::Stream;

fn protocol_versions(mode: Encryption) -> &'static [&'static SupportedProtocolVersion] {
	static TLS12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
	static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
	match mode {
		Encryption::Tls12 => TLS12,
		Encryption::Tls13 | Encryption::None => TLS13,
	}
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
	let file = File::open(path).map_err(|_| Error::NotFound {
		path: path.display().to_string(),
	})?;
	let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
	let certs = certs?;
	if certs.is_empty() {
		return Err(Error::InvalidArgument(format!(
			"no certificates found in '{}'",
			path.display()
		)));
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
	let file = File::open(path).map_err(|_| Error::NotFound {
		path: path.display().to_string(),
	})?;
	rustls_pemfile::private_key(&mut BufReader::new(file))?
		.ok_or_else(|| Error::InvalidArgument(format!("no private key found in '{}'", path.display())))
}

/// Builds the server-side context for `config`, or `None` when encryption is
/// disabled.
pub fn server_config_for(config: &crate::config::Configuration) -> Result<Option<Arc<ServerConfig>>> {
	if !config.encryption.is_enabled() {
		return Ok(None);
	}
	let cert = config.cert_path.as_deref().ok_or_else(|| {
		Error::InvalidArgument("encryption enabled but no --cert given".to_string())
	})?;
	let key = config.key_path.as_deref().ok_or_else(|| {
		Error::InvalidArgument("encryption enabled but no --key given".to_string())
	})?;
	server_config(config.encryption, cert, key).map(Some)
}

/// Builds the server-side context from the configured credentials.
pub fn server_config(mode: Encryption, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
	let config = ServerConfig::builder_with_protocol_versions(protocol_versions(mode))
		.with_no_client_auth()
		.with_single_cert(load_certs(cert)?, load_key(key)?)?;
	debug!("TLS server context ready ({})", mode.as_str());
	Ok(Arc::new(config))
}

/// Accepts any server certificate. Bridge endpoints authenticate with the
/// management password, not a certificate chain.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> std::result::Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		rustls::crypto::ring::default_provider()
			.signature_verification_algorithms
			.supported_schemes()
	}
}

/// Builds the client-side context for the configured mode.
pub fn client_config(mode: Encryption) -> Result<Arc<ClientConfig>> {
	warn!("TLS peer certificate is not verified; trust anchors are out of band");
	let config = ClientConfig::builder_with_protocol_versions(protocol_versions(mode))
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
		.with_no_client_auth();
	Ok(Arc::new(config))
}

/// Wraps an accepted socket into a server-side TLS stream.
pub fn wrap_server(config: &Arc<ServerConfig>, socket: TcpStream) -> Result<Stream> {
	let connection = ServerConnection::new(Arc::clone(config))?;
	Ok(Stream::TlsServer(StreamOwned::new(connection, socket)))
}

/// Wraps a connected socket into a client-side TLS stream.
pub fn wrap_client(config: &Arc<ClientConfig>, host: &str, socket: TcpStream) -> Result<Stream> {
	let name = ServerName::try_from(host.to_string())
		.map_err(|_| Error::InvalidArgument(format!("invalid TLS server name '{host}'")))?;
	let connection = ClientConnection::new(Arc::clone(config), name)?;
	Ok(Stream::TlsClient(StreamOwned::new(connection, socket)))
}
