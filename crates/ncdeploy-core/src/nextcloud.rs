//! Application lifecycle actions: database wait, install, web server setup
//! and configuration refresh.

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{HandlerFailure, HandlerResult};
use crate::host::{run_checked, CommandSpec};
use crate::registry::{Action, RegistryBuilder};
use crate::runner::ActionContext;
use crate::types::{DbKind, StatusLevel};

pub const MYSQL_AVAILABLE: &str = "mysql.available";
pub const POSTGRES_AVAILABLE: &str = "postgres.master.available";
pub const APACHE_AVAILABLE: &str = "apache.available";
pub const APACHE_START: &str = "apache.start";

pub const INIT_DONE: &str = "nextcloud.initdone";
pub const SERVICE_AVAILABLE: &str = "nextcloud.serviceavailable";
pub const DATABASE_WAITING: &str = "nextcloud.database.waiting";
pub const CONFIG_CHANGED: &str = "nextcloud.config.changed";

const DATABASE_FLAGS: [&str; 2] = [MYSQL_AVAILABLE, POSTGRES_AVAILABLE];

pub const NEED_DATABASE: &str = "Need Mysql or Postgres database relation to continue";

/// Register the application actions, in execution order.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .action(
            Action::new("database-wait", database_wait)
                .describe("Report that no database relation is available")
                .when_none(DATABASE_FLAGS)
                .when_not(DATABASE_WAITING)
                .sets([DATABASE_WAITING]),
        )
        .action(
            Action::new("database-found", database_found)
                .describe("Stop waiting once a database relation appears")
                .when(DATABASE_WAITING)
                .when_any(DATABASE_FLAGS)
                .clears([DATABASE_WAITING]),
        )
        .action(
            Action::new("nextcloud-install", install)
                .describe("Install Nextcloud against the related database")
                .when_any(DATABASE_FLAGS)
                .when_not(INIT_DONE)
                .sets([INIT_DONE]),
        )
        .action(
            Action::new("nextcloud-server-config", server_config)
                .describe("Enable web server modules and open the http port")
                .when_all([INIT_DONE, APACHE_AVAILABLE])
                .when_not(SERVICE_AVAILABLE)
                .sets([SERVICE_AVAILABLE, APACHE_START]),
        )
        .action(
            Action::new("nextcloud-config-changed", config_changed)
                .describe("Apply operator configuration changes")
                .when(CONFIG_CHANGED)
                .clears([CONFIG_CHANGED]),
        )
        .transient(CONFIG_CHANGED)
}

/// `occ` invocation as the web user from the application directory.
pub(crate) fn occ<'s>(settings: &Settings, args: impl IntoIterator<Item = &'s str>) -> CommandSpec {
    CommandSpec::new("sudo")
        .args(["-u", settings.web_user.as_str()])
        .arg(settings.php.display().to_string())
        .arg("occ")
        .args(args)
        .cwd(&settings.app_dir)
        .timeout(settings.command_timeout())
}

fn required_config(ctx: &ActionContext<'_>, key: &str) -> Result<String, HandlerFailure> {
    ctx.facts
        .config_value(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| HandlerFailure::Configuration(format!("Missing required config: {key}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn database_wait(ctx: &mut ActionContext<'_>) -> HandlerResult {
    ctx.status(StatusLevel::Blocked, NEED_DATABASE);
    ctx.set_flag(DATABASE_WAITING);
    Ok(())
}

fn database_found(ctx: &mut ActionContext<'_>) -> HandlerResult {
    ctx.clear_flag(DATABASE_WAITING);
    Ok(())
}

fn install(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let settings = ctx.settings;
    let (kind, db) = DbKind::all()
        .iter()
        .find_map(|&k| ctx.facts.database(k).map(|db| (k, db)))
        .ok_or_else(|| {
            HandlerFailure::Configuration("Failed to determine supported database".into())
        })?;
    let admin_user = required_config(ctx, "admin-username")?;
    let admin_pass = required_config(ctx, "admin-password")?;

    ctx.maintenance("Initializing Nextcloud");
    info!(database = %kind, host = %db.host, "installing nextcloud");

    ctx.host
        .chown_recursive(&settings.app_dir, &settings.web_user, &settings.web_group)?;

    let mut cmd = occ(
        settings,
        [
            "maintenance:install",
            "--database",
            kind.installer_name(),
            "--database-name",
            db.database.as_str(),
            "--database-host",
            db.host.as_str(),
        ],
    );
    if let Some(port) = db.port {
        cmd = cmd.arg("--database-port").arg(port.to_string());
    }
    let cmd = cmd
        .args(["--database-user", db.user.as_str()])
        .arg("--database-pass")
        .secret_arg(db.password.as_str())
        .args(["--admin-user", admin_user.as_str()])
        .arg("--admin-pass")
        .secret_arg(admin_pass.as_str())
        .arg("--data-dir")
        .arg(settings.data_dir().display().to_string());
    run_checked(ctx.host, &cmd)?;

    merge_trusted_domain(ctx)?;

    if let Some(version) = &settings.application_version {
        ctx.host.set_application_version(version);
    }

    ctx.set_flag(INIT_DONE);
    ctx.active("Nextcloud init complete");
    Ok(())
}

/// Add the public hostname as a trusted domain, keyed so `localhost` stays.
fn merge_trusted_domain(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let domain = ctx
        .facts
        .config_value("fqdn")
        .filter(|v| !v.trim().is_empty())
        .or_else(|| ctx.facts.public_address());
    let Some(domain) = domain else {
        warn!("no fqdn or public address known; trusted domains left unchanged");
        return Ok(());
    };
    let cmd = occ(
        ctx.settings,
        [
            "config:system:set",
            "trusted_domains",
            "1",
            "--value",
            domain.as_str(),
        ],
    );
    run_checked(ctx.host, &cmd)?;
    Ok(())
}

fn server_config(ctx: &mut ActionContext<'_>) -> HandlerResult {
    let settings = ctx.settings;
    for module in &settings.apache_modules {
        let cmd = CommandSpec::new("a2enmod")
            .arg(module.as_str())
            .timeout(settings.command_timeout());
        run_checked(ctx.host, &cmd)?;
    }
    ctx.host.open_port(settings.http_port)?;

    ctx.set_flag(SERVICE_AVAILABLE);
    ctx.set_flag(APACHE_START);
    ctx.active("Ready");
    Ok(())
}

fn config_changed(ctx: &mut ActionContext<'_>) -> HandlerResult {
    if ctx.is_set(INIT_DONE) {
        merge_trusted_domain(ctx)?;
    }
    ctx.clear_flag(CONFIG_CHANGED);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
