use std::{fs, io};

use acme_core::{Directory, DirectoryUrl};

const ACCOUNTS_DIR: &str = "./acme-accounts";

const CONTACT_EMAIL: Option<&str> = None;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("ensuring accounts dir exists");
    fs::create_dir_all(ACCOUNTS_DIR)?;

    log::info!("fetching LetsEncrypt directory");
    let dir = Directory::fetch(DirectoryUrl::LetsEncryptStaging).await?;

    let key_path = format!("{ACCOUNTS_DIR}/account.pem");

    log::info!("loading account key from disk");
    let acc = match fs::read_to_string(&key_path) {
        Ok(private_key_pem) => {
            log::info!("loading account from existing key");
            dir.load_existing_account(&private_key_pem).await?
        }

        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let contact = CONTACT_EMAIL.map(|email| vec![format!("mailto:{email}")]);

            log::info!("generating account key and registering with ACME provider");
            let acc = dir.register_account(contact, true).await?;

            log::info!("persisting account key to {key_path}");
            fs::write(&key_path, acc.private_key_pem().as_bytes())?;

            acc
        }

        Err(err) => return Err(err.into()),
    };

    log::info!("account URL: {}", acc.account_url());

    // Roll the account over to a fresh key and persist it. After this, the
    // old key no longer authenticates the account.
    log::info!("rolling account key");
    acc.change_key(None).await?;
    fs::write(&key_path, acc.private_key_pem().as_bytes())?;

    log::info!("rollover done; new key persisted to {key_path}");

    Ok(())
}
