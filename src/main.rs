use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use clap_stdin::MaybeStdin;
use popp::{
    definitions::{token::ProofClaims, CardIdentifiers, Command, ScenarioCatalog, StatusWord},
    issuance::{CredentialStore, TokenIssuer},
    presentation::TokenParser,
    Config,
};
use serde_json::json;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Decode a hex encoded command APDU.
    ParseApdu {
        apdu: MaybeStdin<String>,
    },
    /// Describe a status word such as 6A82.
    Status { word: String },
    /// List the scenarios of a catalog file and check that they decode.
    Scenarios { file: PathBuf },
    /// Print the header and claims of a proof token.
    InspectToken {
        token: MaybeStdin<String>,
        /// PEM certificate to verify the signature against. Without it the
        /// signature is not checked.
        #[arg(long)]
        trust: Option<PathBuf>,
    },
    /// Mint a proof token for the given card identifiers.
    SignProof {
        /// PEM encoded P-256 private key.
        #[arg(long)]
        key: PathBuf,
        /// Service configuration; defaults apply without it.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        insurer_id: Option<String>,
    },
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().action {
        Action::ParseApdu { apdu } => println!("{}", describe_apdu(&apdu)?),
        Action::Status { word } => println!("{}", describe_status_word(&word)?),
        Action::Scenarios { file } => {
            let catalog = ScenarioCatalog::from_file(&file)
                .with_context(|| format!("could not load scenarios from {}", file.display()))?;
            println!("{}", describe_catalog(&catalog)?)
        }
        Action::InspectToken { token, trust } => {
            let trust = trust
                .map(|path| {
                    CredentialStore::builder()
                        .with_certificate_pem_file(&path)?
                        .build()
                })
                .transpose()
                .context("could not load trusted certificate")?;
            println!("{}", inspect_token(&token, trust)?)
        }
        Action::SignProof {
            key,
            config,
            patient_id,
            insurer_id,
        } => {
            let config = config
                .map(Config::from_file)
                .transpose()
                .context("could not load configuration")?
                .unwrap_or_default();
            let store = CredentialStore::builder()
                .with_signing_key_pem_file(config.signing_key_alias.clone(), &key)
                .and_then(|builder| builder.build())
                .with_context(|| format!("could not load signing key from {}", key.display()))?;
            let identifiers = CardIdentifiers {
                patient_id,
                insurer_id,
            };
            println!("{}", sign_proof(store, &config, &identifiers)?)
        }
    }
    Ok(())
}

fn describe_apdu(apdu: &str) -> Result<String, Error> {
    let command = Command::parse_hex(apdu.trim()).context("could not parse apdu")?;
    let description = json!({
        "cla": format!("{:02X}", command.class()),
        "ins": format!("{:02X}", command.instruction()),
        "p1": format!("{:02X}", command.p1()),
        "p2": format!("{:02X}", command.p2()),
        "data": command.data().map(hex::encode_upper),
        "le": command.expected_length(),
    });
    Ok(serde_json::to_string_pretty(&description)?)
}

fn describe_status_word(word: &str) -> Result<String, Error> {
    let value = u16::from_str_radix(word.trim(), 16)
        .with_context(|| format!("'{word}' is not a hex status word"))?;
    let status = StatusWord::from_u16(value);
    Ok(format!("{status}: {}", status.description()))
}

fn describe_catalog(catalog: &ScenarioCatalog) -> Result<String, Error> {
    let scenarios = catalog
        .names()
        .filter_map(|name| catalog.lookup(name))
        .map(|scenario| {
            json!({
                "name": scenario.name,
                "steps": scenario.steps.iter().map(|step| &step.name).collect::<Vec<_>>(),
            })
        })
        .collect::<Vec<_>>();
    Ok(serde_json::to_string_pretty(&scenarios)?)
}

fn inspect_token(token: &str, trust: Option<CredentialStore>) -> Result<String, Error> {
    let decoded = match trust {
        Some(store) => TokenParser::new(Arc::new(store))
            .parse_verified::<ProofClaims>(token)
            .context("token could not be verified")?,
        None => TokenParser::parse_unverified::<ProofClaims>(token)
            .context("could not decode token")?,
    };
    let description = json!({
        "header": decoded.header,
        "claims": decoded.claims,
    });
    Ok(serde_json::to_string_pretty(&description)?)
}

fn sign_proof(
    store: CredentialStore,
    config: &Config,
    identifiers: &CardIdentifiers,
) -> Result<String, Error> {
    let issuer = TokenIssuer::new(Arc::new(store), config);
    let claims = issuer.proof_claims(identifiers, OffsetDateTime::now_utc());
    Ok(issuer.issue_proof(&claims)?)
}
