//! DNS-over-TLS listener plumbing.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TlsConfig;
use crate::prelude::Error;

use super::{serve_stream, QueryHandler};

pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, Error> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        &config.cert_file_path,
    )?))
    .collect::<Result<Vec<_>, _>>()?;

    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&config.key_file_path)?,
    ))?
    .ok_or_else(|| Error::config("tls key file contains no private key"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::config)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

pub async fn tls_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<QueryHandler>,
    exit: CancellationToken,
) -> Result<(), Error> {
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = exit.cancelled() => return Ok(()),
        };

        let acceptor = acceptor.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%remote, error = %err, "tls accept failed");
                    return;
                }
            };

            if let Err(err) = serve_stream(stream, handler).await {
                debug!(%remote, error = %err, "tls session ended");
            }
        });
    }
}
