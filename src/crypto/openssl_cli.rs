use std::{
    io::Write as _,
    net::IpAddr,
    process::Command,
};

use tempfile::NamedTempFile;
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};
use zeroize::Zeroizing;

use super::{CertificateInfo, CryptoProvider, CsrDomains, CsrParams, KeyedCsr, DEFAULT_KEY_BITS};
use crate::error::{Error, Result};

/// Crypto backend that shells out to the `openssl` binary.
///
/// Input PEMs are written to temp files (the CLI has no way to take keys on
/// stdin for every subcommand) which are removed as soon as the command
/// finishes. Outputs are normalized to match [`RustCryptoProvider`] exactly.
///
/// [`RustCryptoProvider`]: super::RustCryptoProvider
#[derive(Debug, Clone)]
pub struct OpensslCliProvider {
    binary: String,
}

impl Default for OpensslCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpensslCliProvider {
    pub fn new() -> Self {
        Self::with_binary("openssl")
    }

    /// Uses a non-PATH openssl binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the configured binary can be executed at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }
}

/// Executes a command, checks the exit code, and returns the stdout bytes.
fn execute(command: &mut Command) -> Result<Vec<u8>> {
    let output = command
        .output()
        .map_err(|err| Error::Crypto(format!("failed to execute {command:?}: {err}")))?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Crypto(format!(
            "{command:?} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Executes a command and parses the stdout as a string.
fn execute_stdout(command: &mut Command) -> Result<String> {
    let stdout = execute(command)?;
    String::from_utf8(stdout)
        .map_err(|err| Error::Crypto(format!("openssl output is not utf-8: {err}")))
}

fn temp_file(contents: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|err| Error::Crypto(format!("temp file creation: {err}")))?;
    file.write_all(contents)
        .map_err(|err| Error::Crypto(format!("temp file write: {err}")))?;
    file.flush()
        .map_err(|err| Error::Crypto(format!("temp file flush: {err}")))?;

    Ok(file)
}

fn is_certificate(pem: &str) -> bool {
    pem.contains("-----BEGIN CERTIFICATE-----")
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    let padded = if hex.len() % 2 == 1 {
        format!("0{hex}")
    } else {
        hex.to_owned()
    };

    let mut out = Vec::with_capacity(padded.len() / 2);
    for chunk in padded.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).expect("chunked ascii");
        let byte = u8::from_str_radix(pair, 16)
            .map_err(|err| Error::Crypto(format!("invalid hex from openssl: {err}")))?;
        out.push(byte);
    }

    if out.is_empty() {
        return Err(Error::Crypto("empty hex value from openssl".to_owned()));
    }

    // normalize away superfluous leading zeroes
    let first_nonzero = out.iter().position(|b| *b != 0).unwrap_or(out.len() - 1);
    Ok(out.split_off(first_nonzero))
}

impl CryptoProvider for OpensslCliProvider {
    fn generate_private_key(&self, bits: u32) -> Result<Zeroizing<String>> {
        let pem = execute_stdout(
            self.command()
                .arg("genpkey")
                .arg("-algorithm")
                .arg("RSA")
                .arg("-pkeyopt")
                .arg(format!("rsa_keygen_bits:{bits}")),
        )?;

        Ok(Zeroizing::new(pem))
    }

    fn modulus(&self, pem: &str) -> Result<Vec<u8>> {
        let file = temp_file(pem.as_bytes())?;
        let subcommand = if is_certificate(pem) { "x509" } else { "rsa" };

        let out = execute_stdout(
            self.command()
                .arg(subcommand)
                .arg("-noout")
                .arg("-modulus")
                .arg("-in")
                .arg(file.path()),
        )?;

        let hex = out
            .trim()
            .strip_prefix("Modulus=")
            .ok_or_else(|| Error::Crypto(format!("unexpected -modulus output: {out}")))?;

        hex_to_bytes(hex)
    }

    fn public_exponent(&self, pem: &str) -> Result<Vec<u8>> {
        let file = temp_file(pem.as_bytes())?;
        let subcommand = if is_certificate(pem) { "x509" } else { "rsa" };

        let out = execute_stdout(
            self.command()
                .arg(subcommand)
                .arg("-noout")
                .arg("-text")
                .arg("-in")
                .arg(file.path()),
        )?;

        // keys print `publicExponent: 65537 (0x10001)`,
        // certificates print `Exponent: 65537 (0x10001)`
        let hex = out
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                line.strip_prefix("publicExponent:")
                    .or_else(|| line.strip_prefix("Exponent:"))
            })
            .find_map(|rest| {
                let open = rest.find("(0x")?;
                let close = rest[open..].find(')')? + open;
                Some(rest[open + 3..close].to_owned())
            })
            .ok_or_else(|| Error::Crypto("no exponent in openssl -text output".to_owned()))?;

        hex_to_bytes(&hex)
    }

    fn sign_rs256(&self, key_pem: &str, data: &[u8]) -> Result<Vec<u8>> {
        let key_file = temp_file(key_pem.as_bytes())?;
        let data_file = temp_file(data)?;

        execute(
            self.command()
                .arg("dgst")
                .arg("-sha256")
                .arg("-sign")
                .arg(key_file.path())
                .arg(data_file.path()),
        )
    }

    fn create_csr(&self, params: &CsrParams, key_pem: Option<&str>) -> Result<KeyedCsr> {
        if params.common_name.is_empty() {
            return Err(Error::Config("CSR requires a common name".to_owned()));
        }

        let private_key_pem = match key_pem {
            Some(pem) => Zeroizing::new(pem.to_owned()),
            None => self.generate_private_key(DEFAULT_KEY_BITS)?,
        };

        let key_file = temp_file(private_key_pem.as_bytes())?;

        let mut command = self.command();
        command
            .arg("req")
            .arg("-new")
            .arg("-sha256")
            .arg("-key")
            .arg(key_file.path())
            .arg("-subj")
            .arg(subj_arg(params));

        if let Some(san) = san_arg(&params.alt_names) {
            command.arg("-addext").arg(san);
        }

        let csr_pem = execute_stdout(&mut command)?;

        Ok(KeyedCsr {
            private_key_pem,
            csr_pem,
        })
    }

    fn csr_domains(&self, csr_pem: &str) -> Result<CsrDomains> {
        let file = temp_file(csr_pem.as_bytes())?;

        let out = execute_stdout(
            self.command()
                .arg("req")
                .arg("-noout")
                .arg("-text")
                .arg("-in")
                .arg(file.path()),
        )?;

        Ok(CsrDomains {
            common_name: parse_subject_cn(&out),
            alt_names: parse_san_entries(&out),
        })
    }

    fn certificate_info(&self, cert_pem: &str) -> Result<CertificateInfo> {
        let file = temp_file(cert_pem.as_bytes())?;

        let out = execute_stdout(
            self.command()
                .arg("x509")
                .arg("-noout")
                .arg("-text")
                .arg("-in")
                .arg(file.path()),
        )?;

        let not_before = parse_validity_line(&out, "Not Before")?;
        let not_after = parse_validity_line(&out, "Not After")?;

        Ok(CertificateInfo {
            common_name: parse_subject_cn(&out),
            alt_names: parse_san_entries(&out),
            not_before,
            not_after,
        })
    }
}

fn subj_arg(params: &CsrParams) -> String {
    let mut subj = String::new();

    for (attr, value) in [
        ("C", &params.country),
        ("ST", &params.state),
        ("L", &params.locality),
        ("O", &params.organization),
        ("OU", &params.organization_unit),
    ] {
        if let Some(value) = value {
            subj.push_str(&format!("/{attr}={value}"));
        }
    }

    subj.push_str(&format!("/CN={}", params.common_name));
    subj
}

fn san_arg(alt_names: &[String]) -> Option<String> {
    if alt_names.is_empty() {
        return None;
    }

    let mut seen = Vec::new();
    let mut entries = Vec::new();

    for name in alt_names {
        if seen.contains(name) {
            continue;
        }
        seen.push(name.clone());

        if name.parse::<IpAddr>().is_ok() {
            entries.push(format!("IP:{name}"));
        } else {
            entries.push(format!("DNS:{name}"));
        }
    }

    Some(format!("subjectAltName={}", entries.join(",")))
}

/// Pulls the CN out of an openssl `Subject:` line, which prints as
/// `Subject: C = US, CN = example.com` (or `CN=example.com` on older
/// builds).
fn parse_subject_cn(text: &str) -> Option<String> {
    let subject = text
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Subject:"))?;

    subject.split(',').find_map(|part| {
        let (attr, value) = part.split_once('=')?;
        (attr.trim() == "CN").then(|| value.trim().to_owned())
    })
}

/// Collects `DNS:` and `IP Address:` entries from the SAN section of
/// `-text` output, preserving their order.
fn parse_san_entries(text: &str) -> Vec<String> {
    let mut lines = text.lines();
    let mut entries = Vec::new();

    while let Some(line) = lines.next() {
        if !line.trim().starts_with("X509v3 Subject Alternative Name") {
            continue;
        }

        let Some(san_line) = lines.next() else { break };

        for entry in san_line.trim().split(',') {
            let entry = entry.trim();
            if let Some(dns) = entry.strip_prefix("DNS:") {
                entries.push(dns.to_owned());
            } else if let Some(ip) = entry.strip_prefix("IP Address:") {
                entries.push(ip.trim().to_owned());
            }
        }

        break;
    }

    entries
}

/// Parses `Not Before: Jun  4 12:00:00 2026 GMT` style validity lines.
fn parse_validity_line(text: &str, label: &str) -> Result<OffsetDateTime> {
    let value = text
        .lines()
        .map(str::trim)
        .find_map(|line| {
            // `Not After` prints with a space before the colon
            let rest = line.strip_prefix(label)?;
            rest.trim_start().strip_prefix(':')
        })
        .map(str::trim)
        .ok_or_else(|| Error::Crypto(format!("no `{label}` in openssl output")))?;

    let format = format_description!(
        "[month repr:short] [day padding:space] [hour]:[minute]:[second] [year] GMT"
    );

    PrimitiveDateTime::parse(value, &format)
        .map(|dt| dt.assume_utc())
        .map_err(|err| Error::Crypto(format!("unparseable validity `{value}`: {err}")))
}
