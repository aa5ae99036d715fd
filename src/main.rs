use anyhow::{Context, Result};
use clap::Parser;
use ldap_result_decoder::config::{BindConfig, TlsConfig};
use ldap_result_decoder::controls::{PAGED_RESULTS_OID, PASSWORD_POLICY_OID, SORT_REQUEST_OID};
use ldap_result_decoder::filter::parse_filter;
use ldap_result_decoder::ldap_protocol::SearchRequest;
use ldap_result_decoder::session::whoami_identity;
use ldap_result_decoder::{
    fetch_results, ldif, Config, ControlsContext, LdapResult, MessageId, ResultItem, Session, WaitMode,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "ldap-fetch")]
#[command(about = "Search an LDAP directory and print the results as LDIF")]
struct Args {
    /// Configuration file path (defaults apply when the file is missing)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// LDAP URI (overrides config; e.g. ldaps://ldap.example.com)
    #[arg(short = 'H', value_name = "URI")]
    uri: Option<String>,

    /// Issue StartTLS before binding (ldap:// only)
    #[arg(short = 'Z', long)]
    starttls: bool,

    /// Bind DN for simple authentication
    #[arg(short = 'D', value_name = "BINDDN")]
    binddn: Option<String>,

    /// Bind password
    #[arg(short = 'w', value_name = "PASSWORD")]
    password: Option<String>,

    /// Search base
    #[arg(short = 'b', value_name = "BASE")]
    base: Option<String>,

    /// Search scope: base, one, sub or children
    #[arg(short = 's', value_name = "SCOPE")]
    scope: Option<String>,

    /// Page size for the simple paged results control
    #[arg(long, value_name = "N")]
    page_size: Option<u32>,

    /// Server side sort keys, e.g. "-uidNumber cn"
    #[arg(long, value_name = "KEYS")]
    sort: Option<String>,

    /// Request password policy information with the bind
    #[arg(long)]
    ppolicy: bool,

    /// Print the authorization identity instead of searching
    #[arg(long)]
    whoami: bool,

    /// Seconds to wait for each batch of results (0 = no limit)
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Search filter
    filter: Option<String>,

    /// Attributes to return
    attributes: Vec<String>,
}

impl Args {
    fn apply_to(self, config: &mut Config) {
        if let Some(uri) = self.uri {
            config.uri = uri;
        }
        if self.starttls {
            config.tls.get_or_insert_with(TlsConfig::default).start_tls = true;
        }
        if self.binddn.is_some() || self.password.is_some() || self.ppolicy {
            let bind = config.bind.get_or_insert_with(BindConfig::default);
            if self.binddn.is_some() {
                bind.binddn = self.binddn;
            }
            if self.password.is_some() {
                bind.credentials = self.password;
            }
            bind.password_policy |= self.ppolicy;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        let search = &mut config.search;
        if let Some(base) = self.base {
            search.base = base;
        }
        if let Some(scope) = self.scope {
            search.scope = scope;
        }
        if let Some(page_size) = self.page_size {
            search.page_size = page_size;
        }
        if self.sort.is_some() {
            search.sort = self.sort;
        }
        if let Some(filter) = self.filter {
            search.filter = filter;
        }
        if !self.attributes.is_empty() {
            search.attributes = self.attributes;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_result_decoder={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file_or_default(path)?,
        None => Config::default(),
    };
    let whoami = args.whoami;
    args.apply_to(&mut config);

    let mut session = Session::connect(&config.uri, &config.connect_options())
        .await
        .with_context(|| format!("Connect to {}", config.uri))?;
    let timeout = config.fetch_timeout();

    if let Some(bind) = &config.bind {
        let result = bind_simple(&mut session, bind, &config).await?;
        if !result.is_success() {
            eprintln!("ldap_bind: {} ({})", result.message, result.result_code);
            if let Some(text) = &result.diagnostic_message {
                eprintln!("\tadditional info: {}", text);
            }
            return Ok(exit_code(result.result_code));
        }
    }

    let code = if whoami {
        let id = session.whoami(None).await?;
        let result = session.result(id, timeout, None).await?.success()?;
        match whoami_identity(&result) {
            Some(identity) if !identity.is_empty() => println!("{}", identity),
            _ => println!("anonymous"),
        }
        result.result_code
    } else {
        run_search(&mut session, &config).await?
    };

    session.unbind().await?;
    Ok(exit_code(code))
}

async fn bind_simple(session: &mut Session, bind: &BindConfig, config: &Config) -> Result<LdapResult> {
    let binddn = bind.binddn.as_deref().unwrap_or_default();
    let password = bind.credentials.as_deref().unwrap_or_default();
    let mut ctx = ControlsContext::new();
    if bind.password_policy {
        ctx.add_control(PASSWORD_POLICY_OID, None, false, false)?;
    }

    let id = session.simple_bind(binddn, password.as_bytes(), Some(&ctx)).await?;
    let result = session.result(id, config.fetch_timeout(), Some(&mut ctx)).await?;
    info!("Bind as {:?}: {}", binddn, result.message);

    let policy = result
        .response_controls
        .as_ref()
        .and_then(|extras| extras.password_policy.as_ref());
    if let Some(policy) = policy {
        if policy.expire >= 0 {
            println!("# Password expires in {} seconds", policy.expire);
        }
        if policy.grace >= 0 {
            println!("# {} grace logins remaining", policy.grace);
        }
        if policy.error.is_some() {
            println!("# Password policy error: {}", policy.message);
        }
    }
    Ok(result)
}

/// Search (page by page when paging is on) and print LDIF. Returns the last result code.
async fn run_search(session: &mut Session, config: &Config) -> Result<i32> {
    let search = &config.search;
    let mut request = SearchRequest::new(
        search.base.clone(),
        search.search_scope()?,
        parse_filter(&search.filter)?,
    );
    request.attributes = search.attributes.clone();
    request.size_limit = search.size_limit;
    request.time_limit = search.time_limit;
    request.types_only = search.attrs_only;

    let mut ctx = ControlsContext::new();
    if search.page_size > 0 {
        let size = search.page_size.to_string();
        ctx.add_control(PAGED_RESULTS_OID, Some(size.as_bytes()), false, false)?;
    }
    if let Some(keys) = &search.sort {
        ctx.add_control(SORT_REQUEST_OID, Some(keys.as_bytes()), false, false)?;
    }
    let timeout = config.fetch_timeout();

    let stdout = std::io::stdout();
    let mut entries = 0usize;
    let mut pages = 0usize;
    loop {
        let id = session.search(&request, Some(&ctx)).await?;
        pages += 1;
        let result = loop {
            let items = fetch_results(session, MessageId::Id(id), WaitMode::Received, timeout, Some(&mut ctx)).await?;
            let mut out = stdout.lock();
            let mut done = None;
            for item in items {
                match item {
                    ResultItem::Entry(entry) => {
                        entries += 1;
                        ldif::write_entry(&mut out, &entry)?;
                    }
                    ResultItem::Done(result) => {
                        ldif::write_result(&mut out, &result)?;
                        writeln!(out)?;
                        done = Some(result);
                    }
                }
            }
            out.flush()?;
            if let Some(result) = done {
                break result;
            }
        };
        debug!("Page {} finished with {}", pages, result.result_code);
        if !result.is_success() || !ctx.has_more_pages() {
            info!("Search returned {} entries in {} page(s)", entries, pages);
            return Ok(result.result_code);
        }
    }
}

fn exit_code(result_code: i32) -> ExitCode {
    match result_code {
        0 => ExitCode::SUCCESS,
        code => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    }
}
