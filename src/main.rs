use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use afrelay::{
	api::{self, ApiContext},
	caea::CaeaEngine,
	clock::{Clock, SystemClock},
	logging,
	observability::Observability,
	scheduler::Scheduler,
	settings::{CommandLineOptions, Settings},
	sntp::SntpClient,
	soap::{wsaa::WsaaClient, wsfe::WsfeClient, wspci::WspciClient, HttpTransport, SoapTransport},
	state::StateDb,
	wsaa::{TicketKeeper, TimeSource},
};

fn environment_name(production: bool) -> &'static str {
	if production {
		"Production"
	} else {
		"Homologation"
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let opts = CommandLineOptions::parse();
	let settings = Settings::new(opts).context("Could not load settings")?;
	logging::init_json_logger();

	tracing::info!("WSAA environment: {}", environment_name(settings.afip.wsaa.production));
	tracing::info!("WSFE environment: {}", environment_name(settings.afip.wsfe.production));
	tracing::info!("WSPCI environment: {}", environment_name(settings.afip.wspci.production));

	let obs = Observability::new(&settings);
	let clock: Arc<dyn Clock> = Arc::new(SystemClock);
	let transport: Arc<dyn SoapTransport> = Arc::new(
		HttpTransport::new().map_err(|error| anyhow!("Could not build HTTP client: {error}"))?,
	);
	let sntp = Arc::new(SntpClient::new(settings.wsaa.ntp_server.clone()));
	let time_source: Arc<dyn TimeSource> = sntp.clone();

	let wsaa =
		WsaaClient::new(transport.clone(), settings.afip.wsaa.url().to_string(), obs.clone());
	let wsfe_tickets = Arc::new(TicketKeeper::wsfe(
		&settings,
		wsaa.clone(),
		time_source.clone(),
		clock.clone(),
	));
	let wspci_tickets =
		Arc::new(TicketKeeper::wspci(&settings, wsaa, time_source, clock.clone()));

	let wsfe = Arc::new(WsfeClient::new(
		transport.clone(),
		settings.afip.wsfe.url().to_string(),
		obs.clone(),
	));
	let wspci =
		Arc::new(WspciClient::new(transport, settings.afip.wspci.url().to_string(), obs.clone()));

	let db = StateDb::new(settings.state.db_file.clone());
	db.init().context("Could not initialise the state store")?;

	let engine = Arc::new(CaeaEngine::new(
		&settings,
		db,
		wsfe.clone(),
		wsfe_tickets.clone(),
		obs.clone(),
		clock,
	));

	obs.refresh_token_state_from_files();

	let _jobs = Scheduler {
		engine: engine.clone(),
		wsfe_tickets: wsfe_tickets.clone(),
		wspci_tickets: wspci_tickets.clone(),
		watchdog_period: Duration::from_secs(settings.scheduler.token_watchdog_minutes * 60),
	}
	.spawn();

	let addr: SocketAddr = format!("{}:{}", settings.node.hostname, settings.node.port)
		.parse()
		.with_context(|| {
			format!("Invalid bind address {}:{}", settings.node.hostname, settings.node.port)
		})?;

	let ctx = ApiContext {
		obs,
		engine,
		wsfe,
		wspci,
		wsfe_tickets,
		wspci_tickets,
		sntp,
		jwt_secret: Arc::new(settings.auth.jwt_secret.clone()),
	};

	api::serve(ctx, addr, async {
		tokio::signal::ctrl_c().await.ok();
		tracing::info!("Shutdown signal received");
	})
	.await;

	Ok(())
}
