use std::fs;

use acme_core::{
    crypto::{CryptoProvider as _, CsrParams, RustCryptoProvider},
    AutoOptions, Directory, DirectoryUrl,
};
use actix_files::Files;
use actix_web::{middleware::Logger, App, HttpServer};

const CHALLENGE_DIR: &str = "./acme-challenges";
const DOMAINS: &[&str] = &["acme.example.org", "www.acme.example.org"];
const CONTACT_EMAIL: Option<&str> = None;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("ensuring challenge dir exists");
    fs::create_dir_all(CHALLENGE_DIR)?;

    log::info!("starting temporary HTTP challenge server");
    let srv = HttpServer::new(|| {
        App::new()
            .wrap(Logger::default().log_target("acme_http_server"))
            .service(Files::new("/.well-known/acme-challenge", CHALLENGE_DIR).show_files_listing())
    })
    .bind(("0.0.0.0", 80))?
    .workers(1)
    .disable_signals()
    .shutdown_timeout(0)
    .run();

    let srv_handle = srv.handle();
    let srv_task = actix_web::rt::spawn(srv);

    log::info!("fetching LetsEncrypt directory");
    // Create a directory entrypoint.
    // Note: Change to `DirectoryUrl::LetsEncrypt` in production.
    let dir = Directory::fetch(DirectoryUrl::LetsEncryptStaging).await?;

    log::info!("creating certificate key and CSR for {DOMAINS:?}");
    let crypto = RustCryptoProvider::new();
    let bundle = crypto.create_csr(&CsrParams::for_domains(DOMAINS.iter().copied()), None)?;

    // The challenge callbacks: the http-01 proof is a text file under the
    // well-known path, named by the token, containing the key
    // authorization.
    let mut options = AutoOptions::new(
        bundle.csr_pem.clone(),
        |_auth, challenge, key_auth| {
            let path = format!("{CHALLENGE_DIR}/{}", challenge.token);
            async move {
                log::info!("persisting authorization proof to {path}");
                fs::write(path, key_auth)?;
                Ok(())
            }
        },
        |_auth, challenge, _key_auth| {
            let path = format!("{CHALLENGE_DIR}/{}", challenge.token);
            async move {
                log::info!("removing authorization proof {path}");
                fs::remove_file(path)?;
                Ok(())
            }
        },
    )
    .terms_of_service_agreed(true);

    if let Some(email) = CONTACT_EMAIL {
        options = options.email(email);
    }

    log::info!("ordering a new TLS certificate for our domains");
    // `auto` registers (or finds) the account, runs every authorization
    // through the callbacks above, finalizes with our CSR, and downloads
    // the issued chain.
    let cert = dir.auto(None, options).await?;

    // NOTE: Here you would spawn your HTTP server and use the private key
    // plus certificate to configure TLS on it. For this example, we just
    // print the certificate and exit.

    println!("{}", cert.certificate());

    fs::write("certificate-key.pem", bundle.private_key_pem.as_bytes())?;
    log::info!("certificate key written to certificate-key.pem");

    // Stop temporary ACME server.
    srv_handle.stop(true).await;
    srv_task.await??;

    // Delete challenge dir.
    fs::remove_dir_all(CHALLENGE_DIR)?;

    Ok(())
}
