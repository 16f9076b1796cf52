use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use std::io::{BufRead, IsTerminal};
use zeroize::Zeroizing;

use super::Ctx;
use crate::{auth, storage};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Save the project URL and anon key
    Set {
        #[arg(long)]
        url: String,
        #[arg(long)]
        anon_key: String,
    },
    /// Show the effective configuration
    Show,
    /// Delete every stored credential (project and session)
    Reset,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    pub email: String,

    /// Prompted on stdin when omitted. The prompt echoes what is typed; set
    /// TIENDA_PASSWORD or pipe the password in to keep it off the terminal.
    #[arg(long, env = "TIENDA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

pub fn run_config(cmd: ConfigCommand, ctx: &Ctx<'_>) -> Result<()> {
    match cmd {
        ConfigCommand::Set { url, anon_key } => {
            storage::save_project(&url, &anon_key)?;
            ctx.emit(&json!({ "saved": true }), |_| "Project settings saved.".into())
        }
        ConfigCommand::Show => {
            let value = json!({
                "supabase_url": ctx.config.supabase_url,
                "anon_key_set": ctx.config.anon_key.is_some(),
                "data_dir": ctx.config.data_dir.display().to_string(),
                "db_path": ctx.config.db_path().display().to_string(),
                "logged_in": storage::load_session().is_some(),
            });
            ctx.emit(&value, |v| {
                format!(
                    "URL:       {}\nAnon key:  {}\nData dir:  {}\nLogged in: {}",
                    v["supabase_url"].as_str().unwrap_or("(not set)"),
                    if v["anon_key_set"] == true { "set" } else { "(not set)" },
                    v["data_dir"].as_str().unwrap_or(""),
                    v["logged_in"],
                )
            })
        }
        ConfigCommand::Reset => {
            storage::factory_reset()?;
            ctx.emit(&json!({ "reset": true }), |_| "All stored credentials deleted.".into())
        }
    }
}

fn read_password_from_stdin() -> Result<Zeroizing<String>> {
    if std::io::stdin().is_terminal() {
        eprint!("Password (visible, set TIENDA_PASSWORD to avoid echo): ");
    }
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password from stdin")?;
    Ok(Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string()))
}

pub async fn login(args: LoginArgs, ctx: &Ctx<'_>) -> Result<()> {
    let client = auth::anon_client(ctx.config)?;
    let password = match args.password {
        Some(p) => Zeroizing::new(p),
        None => read_password_from_stdin()?,
    };
    let session = auth::login(&client, &args.email, &password).await?;
    storage::save_session(&session).context("saving session to the keyring")?;
    let value = json!({
        "email": session.email,
        "admin": session.is_admin(),
        "expires_at": session.expires_at,
    });
    ctx.emit(&value, |_| {
        let role = if session.is_admin() { " (admin)" } else { "" };
        format!("Logged in as {}{role}.", session.email)
    })
}

pub async fn logout(ctx: &Ctx<'_>) -> Result<()> {
    match auth::anon_client(ctx.config) {
        Ok(client) => auth::logout(&client).await?,
        // Without a project there is nothing to revoke remotely.
        Err(_) => storage::clear_session()?,
    }
    ctx.emit(&json!({ "logged_out": true }), |_| "Logged out.".into())
}

pub fn whoami(ctx: &Ctx<'_>) -> Result<()> {
    let Some(session) = storage::load_session() else {
        return ctx.emit(&json!({ "logged_in": false }), |_| "Not logged in.".into());
    };
    let value = json!({
        "logged_in": true,
        "email": session.email,
        "user_id": session.claims.sub,
        "role": session.claims.role,
        "expires_at": session.expires_at,
    });
    ctx.emit(&value, |v| {
        format!(
            "{} ({})",
            v["email"].as_str().unwrap_or(""),
            v["role"].as_str().unwrap_or("no role")
        )
    })
}
