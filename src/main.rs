use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use durable_auth::cluster::{ClusterConfig, LocalCluster};
use durable_auth::config::CliConfig;
use durable_auth::core::{create_with_seed, STAKE_OWNER};
use durable_auth::intent::{Intent, StakeAuthorize};
use durable_auth::keys::{read_keypair_file, write_keypair_file, Keypair, Signer};
use durable_auth::manifest::{DetachedSignatureSet, SignerPair};
use durable_auth::message::{Message, Transaction};
use durable_auth::nonce::{NonceProvider, DEFAULT_NONCE_SEED};
use durable_auth::offline::partial_sign;
use durable_auth::rpc::{get_stake_account, ClusterRpc, StakeStatus};
use durable_auth::submit::OnlineSubmitter;
use durable_auth::types::{lamports_to_sol, sol_to_lamports, Hash, Pubkey};
use durable_auth::workflow::{Authorization, WorkflowConfigBuilder};
use durable_auth::{Error, Result};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Offline stake and payment authorization with durable nonces"
)]
struct Cli {
    /// Configuration file [default: ~/.config/durable-auth/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ledger file of the local cluster
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,
    /// Keypair used wherever a command's key is not given
    #[arg(short, long, global = true)]
    keypair: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every transaction-producing command.
///
/// `KEY` is either a keypair file or a bare public key. A bare key can only be
/// satisfied by a `--signer` signature collected offline.
#[derive(Args, Debug)]
struct TxArgs {
    /// Sign without network access and print the signer manifest
    #[arg(long)]
    sign_only: bool,
    /// Nonce value the transaction is bound to
    #[arg(long, value_name = "NONCE_VALUE")]
    blockhash: Option<Hash>,
    /// Nonce account providing the transaction lifetime
    #[arg(long, value_name = "NONCE_ACCOUNT")]
    nonce: Option<Pubkey>,
    #[arg(long, value_name = "KEY")]
    nonce_authority: Option<String>,
    #[arg(long, value_name = "KEY")]
    fee_payer: Option<String>,
    /// Signature produced by an offline signer (repeatable)
    #[arg(long = "signer", value_name = "PUBKEY=SIGNATURE")]
    signers: Vec<SignerPair>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new keypair file
    Keygen {
        #[arg(short, long)]
        outfile: PathBuf,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Credit SOL to an account on the local cluster
    Airdrop {
        amount: f64,
        #[arg(value_name = "KEY")]
        to: Option<String>,
    },
    /// Register a vote account that stake can be delegated to
    AddVoteAccount {
        vote_account: Pubkey,
        #[arg(long, value_name = "KEY")]
        node: Option<String>,
    },
    /// Show an account balance in SOL
    Balance {
        #[arg(value_name = "KEY")]
        account: Option<String>,
    },
    /// Create a nonce account derived from the funding key and a seed
    CreateNonceAccount {
        amount: f64,
        #[arg(long, value_name = "KEY")]
        from: Option<String>,
        #[arg(long, value_name = "KEY")]
        nonce_authority: Option<String>,
        #[arg(long, default_value = DEFAULT_NONCE_SEED)]
        seed: String,
    },
    /// Print the current nonce value
    Nonce { nonce_account: Pubkey },
    /// Show balance, authority and value of a nonce account
    NonceAccount { nonce_account: Pubkey },
    /// Create a stake account derived from a base key and a seed
    CreateStakeAccount {
        amount: f64,
        #[arg(long)]
        seed: String,
        #[arg(long, value_name = "KEY")]
        from: Option<String>,
        #[arg(long, value_name = "KEY")]
        base: Option<String>,
        #[arg(long)]
        stake_authority: Option<Pubkey>,
        #[arg(long)]
        withdraw_authority: Option<Pubkey>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Delegate a stake account to a vote account
    DelegateStake {
        stake_account: Pubkey,
        vote_account: Pubkey,
        #[arg(long, value_name = "KEY")]
        stake_authority: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Deactivate a delegated stake account
    DeactivateStake {
        stake_account: Pubkey,
        #[arg(long, value_name = "KEY")]
        stake_authority: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Move part of a stake account into a new account derived from a seed
    SplitStake {
        stake_account: Pubkey,
        amount: f64,
        #[arg(long)]
        seed: String,
        #[arg(long, value_name = "KEY")]
        base: Option<String>,
        #[arg(long, value_name = "KEY")]
        stake_authority: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Reassign the staker or withdrawer of a stake account
    StakeAuthorize {
        stake_account: Pubkey,
        #[arg(long)]
        role: StakeAuthorize,
        #[arg(long)]
        new_authority: Pubkey,
        /// Current holder of the role (the withdrawer may also reassign the staker)
        #[arg(long, value_name = "KEY")]
        authority: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Transfer SOL
    Pay {
        to: Pubkey,
        amount: f64,
        #[arg(long, value_name = "KEY")]
        from: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Withdraw SOL from a nonce account; withdrawing everything closes it
    WithdrawFromNonce {
        nonce_account: Pubkey,
        to: Pubkey,
        amount: f64,
        /// Nonce authority of the account being withdrawn from
        #[arg(long, value_name = "KEY")]
        authority: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Reassign the authority of a nonce account
    AuthorizeNonce {
        nonce_account: Pubkey,
        new_authority: Pubkey,
        #[arg(long, value_name = "KEY")]
        authority: Option<String>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Show a stake account
    StakeAccount { stake_account: Pubkey },
}

fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("durable_auth=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let ctx = Context::new(&cli)?;
    match cli.command {
        Commands::Keygen { outfile, force } => keygen(&outfile, force),
        Commands::Airdrop { amount, to } => {
            let cluster = ctx.open_cluster()?;
            let to = ctx.key(to.as_deref())?.pubkey();
            cluster.airdrop(&to, lamports(amount)?)?;
            ctx.save(&cluster)?;
            println!("{} SOL", lamports_to_sol(cluster.get_balance(&to)?));
            Ok(())
        }
        Commands::AddVoteAccount { vote_account, node } => {
            let cluster = ctx.open_cluster()?;
            let node = ctx.key(node.as_deref())?.pubkey();
            cluster.add_vote_account(&vote_account, &node)?;
            ctx.save(&cluster)?;
            println!("{vote_account}");
            Ok(())
        }
        Commands::Balance { account } => {
            let cluster = ctx.open_cluster()?;
            let account = ctx.key(account.as_deref())?.pubkey();
            println!("{} SOL", lamports_to_sol(cluster.get_balance(&account)?));
            Ok(())
        }
        Commands::CreateNonceAccount {
            amount,
            from,
            nonce_authority,
            seed,
        } => {
            let cluster = ctx.open_cluster()?;
            let funding = ctx.key(from.as_deref())?;
            let funding_key = funding.require_keypair("funding account")?;
            let authority = match nonce_authority.as_deref() {
                Some(raw) => KeySource::parse(raw)?.pubkey(),
                None => funding.pubkey(),
            };
            let address = NonceProvider::new(&cluster).create_nonce_account_with_seed(
                funding_key,
                &authority,
                lamports(amount)?,
                &seed,
            );
            ctx.save(&cluster)?;
            println!("{}", address?);
            Ok(())
        }
        Commands::Nonce { nonce_account } => {
            let cluster = ctx.open_cluster()?;
            println!(
                "{}",
                NonceProvider::new(&cluster).get_current_nonce(&nonce_account)?
            );
            Ok(())
        }
        Commands::NonceAccount { nonce_account } => {
            let cluster = ctx.open_cluster()?;
            let (lamports, state) = NonceProvider::new(&cluster).get_nonce_account(&nonce_account)?;
            println!("Balance: {} SOL", lamports_to_sol(lamports));
            println!("Nonce blockhash: {}", state.nonce_value);
            println!("Authority: {}", state.authority);
            Ok(())
        }
        Commands::CreateStakeAccount {
            amount,
            seed,
            from,
            base,
            stake_authority,
            withdraw_authority,
            tx,
        } => {
            let from = ctx.key(from.as_deref())?;
            let base = match base.as_deref() {
                Some(raw) => KeySource::parse(raw)?,
                None => ctx.key(None)?,
            };
            let staker = stake_authority.unwrap_or_else(|| from.pubkey());
            let withdrawer = withdraw_authority.unwrap_or(staker);
            let intent = Intent::create_stake_account_with_seed(
                from.pubkey(),
                base.pubkey(),
                &seed,
                lamports(amount)?,
                staker,
                withdrawer,
            )?;
            let address = create_with_seed(&base.pubkey(), &seed, STAKE_OWNER)?;
            info!("Stake account address {}", address);
            run_transaction(&ctx, intent, vec![from, base], tx)
        }
        Commands::DelegateStake {
            stake_account,
            vote_account,
            stake_authority,
            tx,
        } => {
            let authority = ctx.key(stake_authority.as_deref())?;
            let intent = Intent::delegate_stake(stake_account, vote_account, authority.pubkey());
            run_transaction(&ctx, intent, vec![authority], tx)
        }
        Commands::DeactivateStake {
            stake_account,
            stake_authority,
            tx,
        } => {
            let authority = ctx.key(stake_authority.as_deref())?;
            let intent = Intent::deactivate_stake(stake_account, authority.pubkey());
            run_transaction(&ctx, intent, vec![authority], tx)
        }
        Commands::SplitStake {
            stake_account,
            amount,
            seed,
            base,
            stake_authority,
            tx,
        } => {
            let authority = ctx.key(stake_authority.as_deref())?;
            let base = match base.as_deref() {
                Some(raw) => KeySource::parse(raw)?,
                None => ctx.key(None)?,
            };
            let intent = Intent::split_stake_with_seed(
                stake_account,
                authority.pubkey(),
                base.pubkey(),
                &seed,
                lamports(amount)?,
            )?;
            info!(
                "Split stake account address {}",
                create_with_seed(&base.pubkey(), &seed, STAKE_OWNER)?
            );
            run_transaction(&ctx, intent, vec![authority, base], tx)
        }
        Commands::StakeAuthorize {
            stake_account,
            role,
            new_authority,
            authority,
            tx,
        } => {
            let authority = ctx.key(authority.as_deref())?;
            let intent =
                Intent::authorize_stake(stake_account, authority.pubkey(), new_authority, role);
            run_transaction(&ctx, intent, vec![authority], tx)
        }
        Commands::Pay {
            to,
            amount,
            from,
            tx,
        } => {
            let from = ctx.key(from.as_deref())?;
            let intent = Intent::pay(from.pubkey(), to, lamports(amount)?);
            run_transaction(&ctx, intent, vec![from], tx)
        }
        Commands::WithdrawFromNonce {
            nonce_account,
            to,
            amount,
            authority,
            tx,
        } => {
            let authority = ctx.key(authority.as_deref())?;
            let intent = Intent::withdraw_nonce(
                nonce_account,
                authority.pubkey(),
                to,
                lamports(amount)?,
            );
            run_transaction(&ctx, intent, vec![authority], tx)
        }
        Commands::AuthorizeNonce {
            nonce_account,
            new_authority,
            authority,
            tx,
        } => {
            let authority = ctx.key(authority.as_deref())?;
            let intent = Intent::authorize_nonce(nonce_account, authority.pubkey(), new_authority);
            run_transaction(&ctx, intent, vec![authority], tx)
        }
        Commands::StakeAccount { stake_account } => {
            let cluster = ctx.open_cluster()?;
            let (lamports, state) = get_stake_account(&cluster, &stake_account)?;
            println!("Balance: {} SOL", lamports_to_sol(lamports));
            match state.status {
                StakeStatus::Initialized => println!("Stake account is undelegated"),
                StakeStatus::Delegated { vote_account } => {
                    println!("Delegated vote account: {vote_account}")
                }
                StakeStatus::Deactivated { vote_account } => {
                    println!("Deactivated, previously delegated to: {vote_account}")
                }
            }
            println!("Stake authority: {}", state.stake_authority);
            println!("Withdraw authority: {}", state.withdraw_authority);
            Ok(())
        }
    }
}

struct Context {
    config: CliConfig,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = CliConfig::resolve(cli.config.as_deref())?;
        if let Some(ledger) = &cli.ledger {
            config.ledger_path = ledger.clone();
        }
        if let Some(keypair) = &cli.keypair {
            config.keypair_path = Some(keypair.clone());
        }
        config.validate()?;
        debug!("Using ledger {}", config.ledger_path.display());
        Ok(Self { config })
    }

    fn open_cluster(&self) -> Result<LocalCluster> {
        let cluster_config = ClusterConfig {
            lamports_per_signature: self.config.lamports_per_signature,
            ..ClusterConfig::default()
        };
        LocalCluster::open(&self.config.ledger_path, cluster_config)
    }

    fn save(&self, cluster: &LocalCluster) -> Result<()> {
        cluster.save(&self.config.ledger_path)
    }

    /// Resolves an explicit `KEY` argument, falling back to the default keypair.
    fn key(&self, raw: Option<&str>) -> Result<KeySource> {
        match (raw, &self.config.keypair_path) {
            (Some(raw), _) => KeySource::parse(raw),
            (None, Some(path)) => Ok(KeySource::Keypair(read_keypair_file(path)?)),
            (None, None) => Err(Error::InvalidConfig(
                "no key given and no default keypair configured (use --keypair)".into(),
            )),
        }
    }
}

enum KeySource {
    Keypair(Keypair),
    Pubkey(Pubkey),
}

impl KeySource {
    fn parse(raw: &str) -> Result<Self> {
        if let Ok(pubkey) = raw.parse::<Pubkey>() {
            return Ok(Self::Pubkey(pubkey));
        }
        Ok(Self::Keypair(read_keypair_file(Path::new(raw))?))
    }

    fn pubkey(&self) -> Pubkey {
        match self {
            Self::Keypair(keypair) => keypair.pubkey(),
            Self::Pubkey(pubkey) => *pubkey,
        }
    }

    fn keypair(&self) -> Option<&Keypair> {
        match self {
            Self::Keypair(keypair) => Some(keypair),
            Self::Pubkey(_) => None,
        }
    }

    fn require_keypair(&self, role: &'static str) -> Result<&Keypair> {
        self.keypair().ok_or(Error::MissingAuthority {
            role,
            pubkey: self.pubkey(),
        })
    }
}

/// Keypairs among `sources`, each key once.
fn keypairs<'a>(sources: impl IntoIterator<Item = &'a KeySource>) -> Vec<&'a Keypair> {
    let mut seen = BTreeSet::new();
    sources
        .into_iter()
        .filter_map(KeySource::keypair)
        .filter(|keypair| seen.insert(keypair.pubkey()))
        .collect()
}

fn lamports(sol: f64) -> Result<u64> {
    sol_to_lamports(sol)
        .ok_or_else(|| Error::InvalidConfig(format!("invalid SOL amount {sol}")))
}

fn keygen(outfile: &Path, force: bool) -> Result<()> {
    if outfile.exists() && !force {
        return Err(Error::Keystore(format!(
            "refusing to overwrite {} (use --force)",
            outfile.display()
        )));
    }
    let keypair = Keypair::new();
    write_keypair_file(outfile, &keypair)?;
    info!("Wrote keypair to {}", outfile.display());
    println!("{}", keypair.pubkey());
    Ok(())
}

fn run_transaction(ctx: &Context, intent: Intent, signers: Vec<KeySource>, tx: TxArgs) -> Result<()> {
    let fee_payer = ctx.key(tx.fee_payer.as_deref())?;
    match tx.nonce {
        Some(nonce_account) => run_durable(ctx, intent, &signers, fee_payer, nonce_account, tx),
        None if tx.sign_only => Err(Error::InvalidConfig(
            "--sign-only requires --nonce and --blockhash".into(),
        )),
        None => run_online(ctx, intent, &signers, &fee_payer, &tx.signers),
    }
}

fn run_durable(
    ctx: &Context,
    intent: Intent,
    signers: &[KeySource],
    fee_payer: KeySource,
    nonce_account: Pubkey,
    tx: TxArgs,
) -> Result<()> {
    let nonce_authority = ctx.key(tx.nonce_authority.as_deref())?;
    let config = WorkflowConfigBuilder::default()
        .fee_payer(fee_payer.pubkey())
        .nonce_account(nonce_account)
        .nonce_authority(nonce_authority.pubkey())
        .build_validated()?;
    let mut auth = Authorization::new(intent, config);
    let keys = keypairs([&fee_payer, &nonce_authority].into_iter().chain(signers));

    if tx.sign_only {
        let nonce_value = tx.blockhash.ok_or_else(|| {
            Error::InvalidConfig("--sign-only requires --blockhash <NONCE_VALUE>".into())
        })?;
        auth.bind_nonce_value(nonce_value)?;
        auth.sign_offline(&keys)?;
        if !tx.signers.is_empty() {
            auth.attach_signatures(DetachedSignatureSet::from_pairs(nonce_value, tx.signers))?;
        }
        if let Some(set) = auth.signatures() {
            print!("{set}");
        }
        return Ok(());
    }

    let cluster = ctx.open_cluster()?;
    let nonce_value = match tx.blockhash {
        Some(value) => {
            auth.bind_nonce_value(value)?;
            value
        }
        None => auth.bind_nonce(&NonceProvider::new(&cluster))?,
    };
    let fee_payer_key = fee_payer.require_keypair("fee payer")?;

    let config = auth.config().clone();
    let mut set = partial_sign(
        auth.intent(),
        nonce_value,
        &config.nonce_account,
        &config.nonce_authority,
        &config.fee_payer,
        &keys,
    )?;
    set.merge(DetachedSignatureSet::from_pairs(nonce_value, tx.signers))?;
    auth.attach_signatures(set)?;

    let outcome = auth.submit(&cluster, fee_payer_key);
    ctx.save(&cluster)?;
    let signature = outcome?;
    info!("Authorization {}", auth.stage());
    println!("{signature}");
    Ok(())
}

fn run_online(
    ctx: &Context,
    intent: Intent,
    signers: &[KeySource],
    fee_payer: &KeySource,
    pairs: &[SignerPair],
) -> Result<()> {
    let cluster = ctx.open_cluster()?;
    let message = Message::new_with_blockhash(intent, fee_payer.pubkey(), cluster.get_latest_blockhash()?);
    let mut transaction = Transaction::new_unsigned(message);
    let keys = keypairs(std::iter::once(fee_payer).chain(signers));
    transaction.try_sign(&keys)?;
    for pair in pairs {
        transaction.add_signature(pair.pubkey, pair.signature)?;
    }
    let outcome = OnlineSubmitter::new(&cluster).send(&transaction);
    ctx.save(&cluster)?;
    println!("{}", outcome?);
    Ok(())
}
