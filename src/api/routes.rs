use std::convert::Infallible;

use serde_json::json;
use warp::{
	filters::BoxedFilter, http::StatusCode, hyper::body::Bytes, reply::Response, Filter,
	Rejection, Reply,
};

use super::{
	auth_header, handle_json, handle_open, handle_query, handlers, raw_query, with_ctx,
	ApiContext, RequestMeta,
};

macro_rules! post_json {
	($ctx:expr, $path:literal, [$($seg:literal)/+], $handler:path) => {
		warp::path!($($seg)/+)
			.and(warp::post())
			.and(with_ctx($ctx.clone()))
			.and(auth_header())
			.and(warp::body::bytes())
			.then(|ctx: ApiContext, auth: Option<String>, body: Bytes| async move {
				handle_json(ctx, RequestMeta::new("POST", $path), auth, body, $handler).await
			})
			.boxed()
	};
}

macro_rules! query_route {
	($ctx:expr, $method:ident, $method_name:literal, $path:literal, [$($seg:literal)/+], $handler:path) => {
		warp::path!($($seg)/+)
			.and(warp::$method())
			.and(with_ctx($ctx.clone()))
			.and(auth_header())
			.and(raw_query())
			.then(|ctx: ApiContext, auth: Option<String>, query: String| async move {
				handle_query(ctx, RequestMeta::new($method_name, $path), auth, query, $handler)
					.await
			})
			.boxed()
	};
}

fn wsfe_routes(ctx: &ApiContext) -> BoxedFilter<(Response,)> {
	let invoices =
		post_json!(ctx, "/wsfe/invoices", ["wsfe" / "invoices"], handlers::generate_invoice);
	let last_authorized = post_json!(
		ctx,
		"/wsfe/invoices/last-authorized",
		["wsfe" / "invoices" / "last-authorized"],
		handlers::last_authorized
	);
	let query = post_json!(
		ctx,
		"/wsfe/invoices/query",
		["wsfe" / "invoices" / "query"],
		handlers::consult_invoice
	);

	let params = post_json!(
		ctx,
		"/wsfe/params/max-reg-x-request",
		["wsfe" / "params" / "max-reg-x-request"],
		handlers::param_max_reg_x_request
	)
	.or(post_json!(
		ctx,
		"/wsfe/params/types-cbte",
		["wsfe" / "params" / "types-cbte"],
		handlers::param_types_cbte
	))
	.unify()
	.or(post_json!(
		ctx,
		"/wsfe/params/types-doc",
		["wsfe" / "params" / "types-doc"],
		handlers::param_types_doc
	))
	.unify()
	.or(post_json!(
		ctx,
		"/wsfe/params/types-iva",
		["wsfe" / "params" / "types-iva"],
		handlers::param_types_iva
	))
	.unify()
	.or(post_json!(
		ctx,
		"/wsfe/params/types-tributos",
		["wsfe" / "params" / "types-tributos"],
		handlers::param_types_tributos
	))
	.unify()
	.or(post_json!(
		ctx,
		"/wsfe/params/types-monedas",
		["wsfe" / "params" / "types-monedas"],
		handlers::param_types_monedas
	))
	.unify()
	.or(post_json!(
		ctx,
		"/wsfe/params/condicion-iva-receptor",
		["wsfe" / "params" / "condicion-iva-receptor"],
		handlers::param_condicion_iva_receptor
	))
	.unify()
	.or(post_json!(
		ctx,
		"/wsfe/params/puntos-venta",
		["wsfe" / "params" / "puntos-venta"],
		handlers::param_puntos_venta
	))
	.unify();

	invoices.or(last_authorized).unify().or(query).unify().or(params).unify().boxed()
}

fn caea_routes(ctx: &ApiContext) -> BoxedFilter<(Response,)> {
	let solicitar = post_json!(
		ctx,
		"/wsfe/caea/solicitar",
		["wsfe" / "caea" / "solicitar"],
		handlers::caea_solicitar
	);
	let consultar = post_json!(
		ctx,
		"/wsfe/caea/consultar",
		["wsfe" / "caea" / "consultar"],
		handlers::caea_consultar
	);
	let informar = post_json!(
		ctx,
		"/wsfe/caea/informar",
		["wsfe" / "caea" / "informar"],
		handlers::caea_informar
	);
	let sin_mov_consultar = post_json!(
		ctx,
		"/wsfe/caea/sin-movimiento/consultar",
		["wsfe" / "caea" / "sin-movimiento" / "consultar"],
		handlers::caea_sin_movimiento_consultar
	);
	let sin_mov_informar = post_json!(
		ctx,
		"/wsfe/caea/sin-movimiento/informar",
		["wsfe" / "caea" / "sin-movimiento" / "informar"],
		handlers::caea_sin_movimiento_informar
	);

	let queue_solicitar = post_json!(
		ctx,
		"/wsfe/caea/queue/solicitar",
		["wsfe" / "caea" / "queue" / "solicitar"],
		handlers::queue_solicitar
	);
	let queue_issue_local = post_json!(
		ctx,
		"/wsfe/caea/queue/issue-local",
		["wsfe" / "caea" / "queue" / "issue-local"],
		handlers::queue_issue_local
	);
	let queue_retry = query_route!(
		ctx,
		post,
		"POST",
		"/wsfe/caea/queue/retry",
		["wsfe" / "caea" / "queue" / "retry"],
		handlers::queue_retry
	);
	let queue_outbox = query_route!(
		ctx,
		get,
		"GET",
		"/wsfe/caea/queue/outbox",
		["wsfe" / "caea" / "queue" / "outbox"],
		handlers::queue_outbox
	);
	let queue_active = query_route!(
		ctx,
		get,
		"GET",
		"/wsfe/caea/queue/active",
		["wsfe" / "caea" / "queue" / "active"],
		handlers::queue_active
	);

	solicitar
		.or(consultar)
		.unify()
		.or(informar)
		.unify()
		.or(sin_mov_consultar)
		.unify()
		.or(sin_mov_informar)
		.unify()
		.or(queue_solicitar)
		.unify()
		.or(queue_issue_local)
		.unify()
		.or(queue_retry)
		.unify()
		.or(queue_outbox)
		.unify()
		.or(queue_active)
		.unify()
		.boxed()
}

fn ui_routes(ctx: &ApiContext) -> BoxedFilter<(Response,)> {
	let summary = query_route!(
		ctx,
		get,
		"GET",
		"/ui/metrics/summary",
		["ui" / "metrics" / "summary"],
		handlers::ui_metrics_summary
	);
	let logs = query_route!(ctx, get, "GET", "/ui/logs", ["ui" / "logs"], handlers::ui_logs);
	let errors =
		query_route!(ctx, get, "GET", "/ui/errors", ["ui" / "errors"], handlers::ui_errors);
	let events =
		query_route!(ctx, get, "GET", "/ui/events", ["ui" / "events"], handlers::ui_events);
	let tokens = query_route!(
		ctx,
		get,
		"GET",
		"/ui/tokens/status",
		["ui" / "tokens" / "status"],
		handlers::ui_tokens_status
	);
	let alerts =
		query_route!(ctx, get, "GET", "/ui/alerts", ["ui" / "alerts"], handlers::ui_alerts);
	let operations = query_route!(
		ctx,
		get,
		"GET",
		"/ui/operations/summary",
		["ui" / "operations" / "summary"],
		handlers::ui_operations_summary
	);
	let caea_queue = query_route!(
		ctx,
		get,
		"GET",
		"/ui/caea/queue",
		["ui" / "caea" / "queue"],
		handlers::ui_caea_queue
	);
	let caea_queue_retry = query_route!(
		ctx,
		post,
		"POST",
		"/ui/caea/queue/retry",
		["ui" / "caea" / "queue" / "retry"],
		handlers::ui_caea_queue_retry
	);
	let assignments = query_route!(
		ctx,
		get,
		"GET",
		"/ui/caea/assignments",
		["ui" / "caea" / "assignments"],
		handlers::ui_caea_assignments
	);

	summary
		.or(logs)
		.unify()
		.or(errors)
		.unify()
		.or(events)
		.unify()
		.or(tokens)
		.unify()
		.or(alerts)
		.unify()
		.or(operations)
		.unify()
		.or(caea_queue)
		.unify()
		.or(caea_queue_retry)
		.unify()
		.or(assignments)
		.unify()
		.boxed()
}

pub fn router(ctx: ApiContext) -> impl Filter<Extract = impl Reply> + Clone {
	let wsaa_token =
		query_route!(&ctx, post, "POST", "/wsaa/token", ["wsaa" / "token"], handlers::wsaa_token);
	let wspci_token = query_route!(
		&ctx,
		post,
		"POST",
		"/wspci/token",
		["wspci" / "token"],
		handlers::wspci_token
	);
	let persona =
		post_json!(&ctx, "/wspci/persona", ["wspci" / "persona"], handlers::get_persona);

	let liveness = warp::path!("health" / "liveness")
		.and(warp::get())
		.and(with_ctx(ctx.clone()))
		.then(|ctx: ApiContext| async move {
			handle_open(ctx, RequestMeta::new("GET", "/health/liveness"), handlers::liveness)
				.await
		})
		.boxed();
	let readiness = query_route!(
		&ctx,
		get,
		"GET",
		"/health/readiness",
		["health" / "readiness"],
		handlers::readiness
	);

	wsaa_token
		.or(wspci_token)
		.unify()
		.or(persona)
		.unify()
		.or(liveness)
		.unify()
		.or(readiness)
		.unify()
		.or(wsfe_routes(&ctx))
		.unify()
		.or(caea_routes(&ctx))
		.unify()
		.or(ui_routes(&ctx))
		.unify()
		.recover(handle_rejection)
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
	let (status, detail) = if rejection.is_not_found() {
		(StatusCode::NOT_FOUND, "Not Found")
	} else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
		(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
	} else {
		(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
	};
	Ok(warp::reply::with_status(warp::reply::json(&json!({"detail": detail})), status))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use chrono::{TimeZone, Utc};
	use serde_json::Value;

	use super::*;
	use crate::{
		caea::CaeaEngine,
		clock::{test_utils::FixedClock, Clock},
		observability::test_utils::new_test_observability,
		settings,
		sntp::SntpClient,
		soap::{
			transport::test_utils::ScriptedTransport,
			wsaa::WsaaClient,
			wsfe::{test_utils::caea_granted_body, WsfeClient},
			wspci::WspciClient,
			SoapCallError,
		},
		state::StateDb,
		wsaa::{ticket::test_utils::*, TicketKeeper},
	};

	const SECRET: &str = "test-secret";

	struct TestApi {
		ctx: ApiContext,
		_dir: tempfile::TempDir,
	}

	fn test_api(outcomes: Vec<Result<String, SoapCallError>>) -> TestApi {
		let dir = tempfile::tempdir().unwrap();
		let mut settings = settings::test_utils::new_test_settings(dir.path());
		let (cert_file, key_file) = write_test_identity(dir.path());
		settings.wsaa.cert_file = cert_file;
		settings.wsaa.key_file = key_file;

		let obs = new_test_observability();
		let clock: Arc<dyn Clock> =
			Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap()));
		let transport = Arc::new(ScriptedTransport::new(outcomes));
		let time_source = Arc::new(FixedTimeSource(test_ticket_times()));

		let wsaa = WsaaClient::new(
			transport.clone(),
			settings.afip.wsaa.url().to_string(),
			obs.clone(),
		);
		let wsfe_tickets = Arc::new(TicketKeeper::wsfe(
			&settings,
			wsaa.clone(),
			time_source.clone(),
			clock.clone(),
		));
		let wspci_tickets =
			Arc::new(TicketKeeper::wspci(&settings, wsaa, time_source, clock.clone()));
		// Stored far-future tickets keep auth off the network.
		for keeper in [&wsfe_tickets, &wspci_tickets] {
			std::fs::create_dir_all(keeper.response_file().parent().unwrap()).unwrap();
			std::fs::write(
				keeper.response_file(),
				ticket_response_xml("2999-01-01T00:00:00-03:00"),
			)
			.unwrap();
		}

		let wsfe = Arc::new(WsfeClient::new(
			transport.clone(),
			settings.afip.wsfe.url().to_string(),
			obs.clone(),
		));
		let wspci = Arc::new(WspciClient::new(
			transport,
			settings.afip.wspci.url().to_string(),
			obs.clone(),
		));

		let db = StateDb::new(settings.state.db_file.clone());
		db.init().unwrap();
		let engine = Arc::new(CaeaEngine::new(
			&settings,
			db,
			wsfe.clone(),
			wsfe_tickets.clone(),
			obs.clone(),
			clock,
		));

		let ctx = ApiContext {
			obs,
			engine,
			wsfe,
			wspci,
			wsfe_tickets,
			wspci_tickets,
			sntp: Arc::new(SntpClient::new("127.0.0.1:1".to_string())),
			jwt_secret: Arc::new(SECRET.to_string()),
		};
		TestApi { ctx, _dir: dir }
	}

	async fn post(
		api: &TestApi,
		path: &str,
		body: &Value,
	) -> (StatusCode, Value, Option<String>) {
		let response = warp::test::request()
			.method("POST")
			.path(path)
			.header("authorization", format!("Bearer {SECRET}"))
			.json(body)
			.reply(&router(api.ctx.clone()))
			.await;
		let trace = response
			.headers()
			.get("x-trace-id")
			.map(|value| value.to_str().unwrap().to_string());
		let payload = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
		(response.status(), payload, trace)
	}

	async fn get(api: &TestApi, path: &str) -> (StatusCode, Value) {
		let response = warp::test::request()
			.method("GET")
			.path(path)
			.header("authorization", format!("Bearer {SECRET}"))
			.reply(&router(api.ctx.clone()))
			.await;
		let payload = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
		(response.status(), payload)
	}

	fn issue_local_body(cycle_id: i64) -> Value {
		json!({
			"CycleId": cycle_id,
			"Cuit": 30740253022i64,
			"PtoVta": 1,
			"CbteTipo": 11,
			"FeCAEARegInfReq": {
				"FeCabReq": {"CantReg": 1, "PtoVta": 1, "CbteTipo": 11},
				"FeDetReq": {"FECAEADetRequest": [{
					"Concepto": 1,
					"DocTipo": 99,
					"DocNro": 0,
					"CbteDesde": 0,
					"CbteHasta": 0,
					"CbteFch": "20260202",
					"ImpTotal": 100.0,
					"ImpNeto": 100.0,
					"MonId": "PES",
					"MonCotiz": 1,
				}]},
			},
		})
	}

	#[tokio::test]
	async fn requests_without_bearer_token_are_rejected() {
		let api = test_api(vec![]);
		let response = warp::test::request()
			.method("POST")
			.path("/wsfe/caea/queue/solicitar")
			.json(&json!({"Cuit": 30740253022i64, "Periodo": 202602, "Orden": 1}))
			.reply(&router(api.ctx.clone()))
			.await;
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

		let payload: Value = serde_json::from_slice(response.body()).unwrap();
		assert_eq!(payload["detail"], json!("Invalid JWT"));
	}

	#[tokio::test]
	async fn liveness_needs_no_auth() {
		let api = test_api(vec![]);
		let response = warp::test::request()
			.method("GET")
			.path("/health/liveness")
			.reply(&router(api.ctx.clone()))
			.await;
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn happy_path_solicit_through_the_api() {
		let api = test_api(vec![Ok(caea_granted_body("61234567890123"))]);

		let (status, body, trace) = post(
			&api,
			"/wsfe/caea/queue/solicitar",
			&json!({"Cuit": 30740253022i64, "Periodo": 202601, "Orden": 1}),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert!(trace.is_some());
		assert_eq!(body["status"], json!("queued"));
		assert_eq!(body["cycle"]["status"], json!("requested"));
		assert_eq!(body["job"]["status"], json!("pending"));

		let (status, body, _) = post(&api, "/wsfe/caea/queue/retry?limit=10", &json!({})).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["result"]["done"], json!(1));

		let (status, body) = get(&api, "/wsfe/caea/queue/outbox?status=done").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["items"].as_array().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn issue_local_reserves_sequential_numbers() {
		let api = test_api(vec![]);
		let (_, body, _) = post(
			&api,
			"/wsfe/caea/queue/solicitar",
			&json!({"Cuit": 30740253022i64, "Periodo": 202602, "Orden": 1}),
		)
		.await;
		let cycle_id = body["cycle"]["id"].as_i64().unwrap();
		api.ctx
			.engine
			.db()
			.update_cycle_from_afip(cycle_id, &json!({"ResultGet": {"CAEA": "61234567890123"}}))
			.unwrap();

		let (status, body, _) =
			post(&api, "/wsfe/caea/queue/issue-local", &issue_local_body(cycle_id)).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["reserved_cbte_nro"], json!(1));
		assert_eq!(body["caea"], json!("61234567890123"));
		assert_eq!(body["invoice"]["status"], json!("issued_local"));

		let (_, body, _) =
			post(&api, "/wsfe/caea/queue/issue-local", &issue_local_body(cycle_id)).await;
		assert_eq!(body["reserved_cbte_nro"], json!(2));

		// Two inform jobs with distinct idempotency keys are queued.
		let (_, body) = get(&api, "/wsfe/caea/queue/outbox?status=pending&limit=20").await;
		let keys = body["items"]
			.as_array()
			.unwrap()
			.iter()
			.filter_map(|item| item["idempotency_key"].as_str())
			.filter(|key| key.starts_with("inform:"))
			.collect::<Vec<_>>();
		assert_eq!(keys.len(), 2);
		assert_ne!(keys[0], keys[1]);
	}

	#[tokio::test]
	async fn issue_local_against_inactive_cycle_is_a_conflict() {
		let api = test_api(vec![]);
		let (_, body, _) = post(
			&api,
			"/wsfe/caea/queue/solicitar",
			&json!({"Cuit": 30740253022i64, "Periodo": 202602, "Orden": 1}),
		)
		.await;
		let cycle_id = body["cycle"]["id"].as_i64().unwrap();

		let (status, _, _) =
			post(&api, "/wsfe/caea/queue/issue-local", &issue_local_body(cycle_id)).await;
		assert_eq!(status, StatusCode::CONFLICT);

		let (status, _, _) =
			post(&api, "/wsfe/caea/queue/issue-local", &issue_local_body(cycle_id + 99)).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn invalid_invoice_date_is_a_422_with_format_hint() {
		let api = test_api(vec![]);
		let body = json!({
			"Auth": {"Cuit": 30740253022i64},
			"FeCAEReq": {
				"FeCabReq": {"CantReg": 1, "PtoVta": 1, "CbteTipo": 11},
				"FeDetReq": {"FECAEDetRequest": [{
					"Concepto": 1,
					"DocTipo": 99,
					"DocNro": 0,
					"CbteDesde": 1,
					"CbteHasta": 1,
					"CbteFch": "2026-01-25",
					"ImpTotal": 100.0,
					"ImpTotConc": 0.0,
					"ImpNeto": 100.0,
					"ImpOpEx": 0.0,
					"ImpTrib": 0.0,
					"ImpIVA": 0.0,
					"MonId": "PES",
					"MonCotiz": 1.0,
					"CondicionIVAReceptorId": 5,
				}]},
			},
		});

		let (status, payload, _) = post(&api, "/wsfe/invoices", &body).await;
		assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
		assert!(payload["detail"].to_string().contains("yyyymmdd"));
	}

	#[tokio::test]
	async fn active_cycles_report_both_windows() {
		let api = test_api(vec![]);
		post(
			&api,
			"/wsfe/caea/queue/solicitar",
			&json!({"Cuit": 30740253022i64, "Periodo": 202602, "Orden": 1}),
		)
		.await;

		let (status, body) = get(&api, "/wsfe/caea/queue/active?cuit=30740253022").await;
		assert_eq!(status, StatusCode::OK);
		let cycles = body["cycles"].as_array().unwrap();
		assert_eq!(cycles.len(), 2);
		assert_eq!(cycles[0]["periodo"], json!(202602));
		assert_eq!(cycles[0]["active"], json!(false));
		assert_eq!(cycles[0]["status"], json!("requested"));
	}

	#[tokio::test]
	async fn envelope_errors_ride_http_200_and_reach_the_request_log() {
		// WSFE pass-through where AFIP faults: still HTTP 200.
		let api = test_api(vec![Ok(
			"<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
			<soap:Body><soap:Fault><faultcode>soap:Client</faultcode>\
			<faultstring>bad request</faultstring></soap:Fault></soap:Body></soap:Envelope>"
				.to_string(),
		)]);

		let (status, body, _) = post(
			&api,
			"/wsfe/invoices/last-authorized",
			&json!({"Cuit": 30740253022i64, "PtoVta": 1, "CbteTipo": 11}),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], json!("error"));
		assert_eq!(body["error"]["error_type"], json!("SOAPFault"));

		// The exchange is logged as failed despite the 200.
		let (_, logs) = get(&api, "/ui/logs?status=error").await;
		assert_eq!(logs["total"], json!(1));
		assert_eq!(logs["items"][0]["cuit"], json!(30740253022i64));
	}

	#[tokio::test]
	async fn monitoring_views_respond() {
		let api = test_api(vec![]);
		post(
			&api,
			"/wsfe/caea/queue/solicitar",
			&json!({"Cuit": 30740253022i64, "Periodo": 202602, "Orden": 1}),
		)
		.await;

		let (status, summary) = get(&api, "/ui/metrics/summary?window_minutes=10").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(summary["total_requests"], json!(1));

		let (status, queue) = get(&api, "/ui/caea/queue").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(queue["summary"]["pending"], json!(1));

		let (status, alerts) = get(&api, "/ui/alerts").await;
		assert_eq!(status, StatusCode::OK);
		assert!(alerts["count"].is_number());

		let (status, _) = get(&api, "/ui/events?event_type=wsfe_caea_http_call").await;
		assert_eq!(status, StatusCode::OK);
	}

	#[tokio::test]
	async fn unknown_outbox_status_is_a_422() {
		let api = test_api(vec![]);
		let (status, body) = get(&api, "/wsfe/caea/queue/outbox?status=bogus").await;
		assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
		assert!(body["detail"].to_string().contains("bogus"));
	}

	#[tokio::test]
	async fn unknown_paths_return_json_404() {
		let api = test_api(vec![]);
		let response = warp::test::request()
			.method("GET")
			.path("/nope")
			.reply(&router(api.ctx.clone()))
			.await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}
}
