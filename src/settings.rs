use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, Map, Source, Value};
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Deserialize, Clone)]
pub struct Node {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Auth {
	pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct State {
	pub db_file: PathBuf,
}

/// One AFIP SOAP service: the production flag picks which endpoint is used.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceEndpoint {
	pub production: bool,
	pub production_endpoint: String,
	pub homologation_endpoint: String,
}

impl ServiceEndpoint {
	pub fn url(&self) -> &str {
		if self.production {
			&self.production_endpoint
		} else {
			&self.homologation_endpoint
		}
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct Afip {
	pub wsaa: ServiceEndpoint,
	pub wsfe: ServiceEndpoint,
	pub wspci: ServiceEndpoint,
}

/// Certificate material and on-disk locations used by the ticket keeper.
#[derive(Debug, Deserialize, Clone)]
pub struct Wsaa {
	pub cert_file: PathBuf,
	pub key_file: PathBuf,
	pub xml_dir: PathBuf,
	pub crypto_dir: PathBuf,
	pub ntp_server: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Scheduler {
	pub token_watchdog_minutes: u64,
	pub wsfe_renew_before_minutes: i64,
	pub wspci_renew_before_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Caea {
	/// Comma-separated CUITs whose cycles are preallocated at bootstrap.
	pub bootstrap_cuits: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Observability {
	pub max_logs: usize,
	pub max_events: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub node: Node,
	pub auth: Auth,
	pub state: State,
	pub afip: Afip,
	pub wsaa: Wsaa,
	pub scheduler: Scheduler,
	pub caea: Caea,
	pub observability: Observability,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,
	#[clap(long = "node.port")]
	node_port: Option<u16>,
	#[clap(long = "state.db_file")]
	state_db_file: Option<String>,
	#[clap(long = "afip.wsaa.production")]
	wsaa_production: Option<bool>,
	#[clap(long = "afip.wsfe.production")]
	wsfe_production: Option<bool>,
	#[clap(long = "afip.wspci.production")]
	wspci_production: Option<bool>,
}

pub fn insert_command_line_option<T>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) where
	T: ToString,
{
	if let Some(value) = option {
		map.insert(key.to_string(), Value::from(value.to_string()));
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "node.port", &self.node_port);
		insert_command_line_option(&mut map, "state.db_file", &self.state_db_file);
		insert_command_line_option(&mut map, "afip.wsaa.production", &self.wsaa_production);
		insert_command_line_option(&mut map, "afip.wsfe.production", &self.wsfe_production);
		insert_command_line_option(&mut map, "afip.wspci.production", &self.wspci_production);

		Ok(map)
	}
}

impl Settings {
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let config_path =
			opts.config_path.clone().unwrap_or_else(|| "config/Default.toml".to_string());

		let mut settings: Settings = Self::set_defaults(Config::builder())?
			.add_source(config::File::with_name(&config_path).required(false))
			.add_source(Environment::default().separator("__"))
			.add_source(Self::legacy_env_overrides()?)
			.add_source(opts)
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		config_builder
			.set_default("node.hostname", "0.0.0.0")?
			.set_default("node.port", 8000i64)?
			.set_default("auth.jwt_secret", "default-secret-change-me")?
			.set_default("state.db_file", "service/state/afrelay_state.db")?
			.set_default("afip.wsaa.production", false)?
			.set_default(
				"afip.wsaa.production_endpoint",
				"https://wsaa.afip.gov.ar/ws/services/LoginCms",
			)?
			.set_default(
				"afip.wsaa.homologation_endpoint",
				"https://wsaahomo.afip.gov.ar/ws/services/LoginCms",
			)?
			.set_default("afip.wsfe.production", false)?
			.set_default(
				"afip.wsfe.production_endpoint",
				"https://servicios1.afip.gov.ar/wsfev1/service.asmx",
			)?
			.set_default(
				"afip.wsfe.homologation_endpoint",
				"https://wswhomo.afip.gov.ar/wsfev1/service.asmx",
			)?
			.set_default("afip.wspci.production", false)?
			.set_default(
				"afip.wspci.production_endpoint",
				"https://aws.afip.gov.ar/sr-padron/webservices/personaServiceA5",
			)?
			.set_default(
				"afip.wspci.homologation_endpoint",
				"https://awshomo.afip.gov.ar/sr-padron/webservices/personaServiceA5",
			)?
			.set_default("wsaa.cert_file", "service/certificates/returned_certificate.pem")?
			.set_default("wsaa.key_file", "service/certificates/PrivateKey.key")?
			.set_default("wsaa.xml_dir", "service/xml_files")?
			.set_default("wsaa.crypto_dir", "service/crypto")?
			.set_default("wsaa.ntp_server", "time.afip.gov.ar:123")?
			.set_default("scheduler.token_watchdog_minutes", 5i64)?
			.set_default(
				"scheduler.wsfe_renew_before_minutes",
				constants::DEFAULT_RENEW_BEFORE_MINUTES,
			)?
			.set_default(
				"scheduler.wspci_renew_before_minutes",
				constants::DEFAULT_RENEW_BEFORE_MINUTES,
			)?
			.set_default("caea.bootstrap_cuits", "")?
			.set_default("observability.max_logs", 5000i64)?
			.set_default("observability.max_events", 2000i64)
	}

	/// The deployment environment configures the service through flat,
	/// historically named variables rather than `SECTION__KEY` pairs. They are
	/// folded in here as an extra override layer.
	fn legacy_env_overrides() -> Result<Config, ConfigError> {
		let pairs: &[(&str, &str)] = &[
			(constants::WSAA_PRODUCTION, "afip.wsaa.production"),
			(constants::WSFE_PRODUCTION, "afip.wsfe.production"),
			(constants::WSPCI_PRODUCTION, "afip.wspci.production"),
			(constants::AFRELAY_STATE_DB, "state.db_file"),
			(constants::AFIP_TOKEN_WATCHDOG_MINUTES, "scheduler.token_watchdog_minutes"),
			(
				constants::WSFE_TOKEN_RENEW_BEFORE_MINUTES,
				"scheduler.wsfe_renew_before_minutes",
			),
			(
				constants::WSPCI_TOKEN_RENEW_BEFORE_MINUTES,
				"scheduler.wspci_renew_before_minutes",
			),
			(constants::CAEA_BOOTSTRAP_CUITS, "caea.bootstrap_cuits"),
			(constants::OBS_MAX_LOGS, "observability.max_logs"),
			(constants::OBS_MAX_EVENTS, "observability.max_events"),
			(constants::JWT_SECRET_KEY, "auth.jwt_secret"),
		];

		let mut builder = Config::builder();
		for (var, key) in pairs {
			builder = builder.set_override_option(*key, std::env::var(var).ok())?;
		}
		builder.build()
	}

	fn validate(&mut self) -> Result<(), ConfigError> {
		if self.scheduler.token_watchdog_minutes == 0 {
			return Err(ConfigError::Message(
				"scheduler.token_watchdog_minutes must be at least 1".to_string(),
			));
		}
		Ok(())
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	/// Settings pointing every external surface at throwaway locations.
	pub fn new_test_settings(base_dir: &std::path::Path) -> Settings {
		Settings {
			node: Node { hostname: "127.0.0.1".to_string(), port: 0 },
			auth: Auth { jwt_secret: "test-secret".to_string() },
			state: State { db_file: base_dir.join("afrelay_state.db") },
			afip: Afip {
				wsaa: ServiceEndpoint {
					production: false,
					production_endpoint: "https://wsaa.invalid/ws/services/LoginCms".to_string(),
					homologation_endpoint: "https://wsaahomo.invalid/ws/services/LoginCms"
						.to_string(),
				},
				wsfe: ServiceEndpoint {
					production: false,
					production_endpoint: "https://wsfe.invalid/service.asmx".to_string(),
					homologation_endpoint: "https://wsfehomo.invalid/service.asmx".to_string(),
				},
				wspci: ServiceEndpoint {
					production: false,
					production_endpoint: "https://wspci.invalid/personaServiceA5".to_string(),
					homologation_endpoint: "https://wspcihomo.invalid/personaServiceA5"
						.to_string(),
				},
			},
			wsaa: Wsaa {
				cert_file: base_dir.join("returned_certificate.pem"),
				key_file: base_dir.join("PrivateKey.key"),
				xml_dir: base_dir.join("xml_files"),
				crypto_dir: base_dir.join("crypto"),
				ntp_server: "127.0.0.1:123".to_string(),
			},
			scheduler: Scheduler {
				token_watchdog_minutes: 5,
				wsfe_renew_before_minutes: 15,
				wspci_renew_before_minutes: 15,
			},
			caea: Caea { bootstrap_cuits: String::new() },
			observability: Observability { max_logs: 5000, max_events: 2000 },
		}
	}
}
