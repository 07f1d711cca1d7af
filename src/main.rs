use std::process::exit;
use std::sync::Arc;

use chrono::Local;
use clap::{App, ArgMatches};
use crossbeam::channel;

use tempfilterd::config::Configuration;
use tempfilterd::influx::InfluxClient;
use tempfilterd::mqtt::MqttBroker;
use tempfilterd::pipeline::{IngestionPipeline, PipelineSettings};
use tempfilterd::report::{self, Reporter, TemperatureScale};
use tempfilterd::service::ServiceLifecycle;
use tempfilterd::writer::PersistenceWriter;

const DEFAULT_CONFIG: &str = "resources/tempfilterd.yml";
const DEFAULT_LOG_CONFIG: &str = "resources/log.yml";

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();

    let log_config = matches.value_of("log-config").unwrap_or(DEFAULT_LOG_CONFIG);
    if let Err(err) = log4rs::init_file(log_config, Default::default()) {
        eprintln!("Could not create logger from yaml configuration '{}': {}", log_config, err);
        exit(100);
    }

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let configuration = match Configuration::from_file(config_path) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "tempfilterd", "Cannot load the configuration '{}': '{}'", config_path, err);
            exit(101);
        }
    };

    match matches.subcommand() {
        ("report", Some(report_matches)) => run_report(configuration, report_matches),
        _ => run_service(configuration),
    }
}

fn run_service(configuration: Configuration) {
    let client = match InfluxClient::new(&configuration.influxdb) {
        Ok(client) => client,
        Err(err) => {
            log::error!(target: "tempfilterd", "Cannot create the database client: '{}'", err);
            exit(201);
        }
    };

    let writer = match PersistenceWriter::new(Arc::new(client), &configuration.influxdb.measurement, &configuration.writer) {
        Ok(writer) => writer,
        Err(err) => {
            log::error!(target: "tempfilterd", "Cannot start the persistence writer: '{}'", err);
            exit(202);
        }
    };

    let allowlist = configuration.allowlist();
    log::info!(target: "tempfilterd", "Accepting {} sensors for {:?}", allowlist.len(), allowlist.locations());

    let mqtt_params = configuration.mqtt.clone();
    let pipeline = IngestionPipeline::new(PipelineSettings::from(&configuration.mqtt), allowlist, writer, move || {
        MqttBroker::connect(&mqtt_params)
    });

    let mut service = ServiceLifecycle::new(&configuration.service.name, configuration.service.stop_timeout(), pipeline);

    let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        log::info!(target: "tempfilterd", "Termination signal received!");
        let _ = shutdown_tx.try_send(());
    }) {
        log::error!(target: "tempfilterd", "Cannot install the termination handler: '{}'", err);
        exit(203);
    }

    if let Err(err) = service.start() {
        log::error!(target: "tempfilterd", "Cannot start the service: '{}'", err);
        exit(204);
    }

    match service.run_until(&shutdown_rx) {
        Ok(()) => {
            log::info!(target: "tempfilterd", "Exiting");
            exit(0);
        }
        Err(err) => {
            log::error!(target: "tempfilterd", "Service ended abnormally: '{}'", err);
            exit(301);
        }
    }
}

fn run_report(configuration: Configuration, matches: &ArgMatches) {
    let scale = match matches.value_of("scale").unwrap_or("celsius").parse::<TemperatureScale>() {
        Ok(scale) => scale,
        Err(err) => {
            log::error!(target: "tempfilterd", "{}", err);
            exit(102);
        }
    };

    let client = match InfluxClient::new(&configuration.influxdb) {
        Ok(client) => client,
        Err(err) => {
            log::error!(target: "tempfilterd", "Cannot create the database client: '{}'", err);
            exit(201);
        }
    };

    let allowlist = configuration.allowlist();
    let reporter = Reporter::new(client, scale);
    let since = report::local_midnight(Local::now());
    match reporter.report(allowlist.locations(), since) {
        Ok(text) => print!("{}", text),
        Err(err) => {
            log::error!(target: "tempfilterd", "Report failed: '{}'", err);
            exit(401);
        }
    }
}
