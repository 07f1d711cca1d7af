//! Daily temperature summary per location, read back from the database.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, LocalResult, TimeZone, Utc};
use thiserror::Error;

use crate::influx::{self, InfluxClient, StoreError, LOCATION_TAG, TEMPERATURE_FIELD};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0} is not celsius or fahrenheit")]
    Scale(String),
    #[error("query for {aggregate} at {location} failed: {source}")]
    Query {
        location: String,
        aggregate: Aggregate,
        #[source]
        source: StoreError,
    },
}

pub fn to_fahrenheit(celsius: f64) -> f64 {
    celsius * 1.8 + 32.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureScale {
    Celsius,
    Fahrenheit,
}

impl TemperatureScale {
    fn convert(self, celsius: f64) -> f64 {
        match self {
            TemperatureScale::Celsius => celsius,
            TemperatureScale::Fahrenheit => to_fahrenheit(celsius),
        }
    }

    fn unit(self) -> &'static str {
        match self {
            TemperatureScale::Celsius => "°C",
            TemperatureScale::Fahrenheit => "°F",
        }
    }
}

impl FromStr for TemperatureScale {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "celsius" => Ok(TemperatureScale::Celsius),
            "fahrenheit" => Ok(TemperatureScale::Fahrenheit),
            _ => Err(ReportError::Scale(s.to_string())),
        }
    }
}

/// Aggregates evaluated over the temperature series of one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
    Last,
}

impl Aggregate {
    /// Name of the matching Flux function.
    pub fn function(self) -> &'static str {
        match self {
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Last => "last",
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function())
    }
}

/// Today's temperatures at one location in celsius. `None` when nothing was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Temperatures {
    pub current: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

impl Temperatures {
    pub fn render(&self, scale: TemperatureScale) -> String {
        let show = |value: Option<f64>| match value {
            Some(celsius) => format!("{:.2}{}", scale.convert(celsius), scale.unit()),
            None => String::from("--"),
        };
        format!(
            "currently {}, with high of {} and low of {}",
            show(self.current),
            show(self.high),
            show(self.low)
        )
    }
}

/// Source of aggregated temperature values.
pub trait TemperatureSource {
    fn aggregate(&self, location: &str, aggregate: Aggregate, since: DateTime<Utc>) -> Result<Option<f64>, StoreError>;
}

impl TemperatureSource for InfluxClient {
    fn aggregate(&self, location: &str, aggregate: Aggregate, since: DateTime<Utc>) -> Result<Option<f64>, StoreError> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: {start}, stop: now())
  |> filter(fn: (r) => r.{tag} == "{location}" and r._field == "{field}")
  |> {function}(column: "_value")"#,
            bucket = self.bucket(),
            start = since.to_rfc3339(),
            tag = LOCATION_TAG,
            location = location.replace('"', "\\\""),
            field = TEMPERATURE_FIELD,
            function = aggregate.function()
        );
        log::trace!(target: "tempfilterd::report", "query: {}", flux);
        influx::first_value(&self.query(&flux)?)
    }
}

/// Start of the current local day.
pub fn local_midnight(now: DateTime<Local>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_else(|| now.naive_local());
    match Local.from_local_datetime(&midnight) {
        LocalResult::Single(time) | LocalResult::Ambiguous(time, _) => time.with_timezone(&Utc),
        LocalResult::None => now.with_timezone(&Utc),
    }
}

/// Renders the daily summary of a set of locations in a fixed scale.
pub struct Reporter<S: TemperatureSource> {
    source: S,
    scale: TemperatureScale,
}

impl<S: TemperatureSource> Reporter<S> {
    pub fn new(source: S, scale: TemperatureScale) -> Self {
        Reporter { source, scale }
    }

    pub fn temperatures(&self, location: &str, since: DateTime<Utc>) -> Result<Temperatures, ReportError> {
        let fetch = |aggregate: Aggregate| {
            self.source
                .aggregate(location, aggregate, since)
                .map_err(|source| ReportError::Query {
                    location: location.to_string(),
                    aggregate,
                    source,
                })
        };
        Ok(Temperatures {
            current: fetch(Aggregate::Last)?,
            high: fetch(Aggregate::Max)?,
            low: fetch(Aggregate::Min)?,
        })
    }

    /// One line per location: `The <location> is currently ...`.
    pub fn report<'a, I>(&self, locations: I, since: DateTime<Utc>) -> Result<String, ReportError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = String::new();
        for location in locations {
            let temperatures = self.temperatures(location, since)?;
            out.push_str(&format!("The {} is {}\n", location, temperatures.render(self.scale)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedSource(HashMap<(&'static str, &'static str), f64>);

    impl TemperatureSource for FixedSource {
        fn aggregate(&self, location: &str, aggregate: Aggregate, _since: DateTime<Utc>) -> Result<Option<f64>, StoreError> {
            Ok(self
                .0
                .iter()
                .find(|((l, a), _)| *l == location && *a == aggregate.function())
                .map(|(_, v)| *v))
        }
    }

    fn source() -> FixedSource {
        let mut values = HashMap::new();
        values.insert(("Garage", "last"), 20.5);
        values.insert(("Garage", "max"), 22.0);
        values.insert(("Garage", "min"), 18.25);
        FixedSource(values)
    }

    #[test]
    fn fahrenheit_conversion_is_exact() {
        assert_eq!(to_fahrenheit(0.0), 32.0);
        assert_eq!(to_fahrenheit(100.0), 212.0);
        assert_eq!(to_fahrenheit(-40.0), -40.0);
    }

    #[test]
    fn scale_parsing() {
        assert_eq!("celsius".parse::<TemperatureScale>().unwrap(), TemperatureScale::Celsius);
        assert_eq!("Fahrenheit".parse::<TemperatureScale>().unwrap(), TemperatureScale::Fahrenheit);
        assert!(matches!("kelvin".parse::<TemperatureScale>(), Err(ReportError::Scale(_))));
    }

    #[test]
    fn render_in_both_scales() {
        let temperatures = Temperatures {
            current: Some(20.0),
            high: Some(100.0),
            low: Some(0.0),
        };
        assert_eq!(
            temperatures.render(TemperatureScale::Celsius),
            "currently 20.00°C, with high of 100.00°C and low of 0.00°C"
        );
        assert_eq!(
            temperatures.render(TemperatureScale::Fahrenheit),
            "currently 68.00°F, with high of 212.00°F and low of 32.00°F"
        );
    }

    #[test]
    fn report_lines_per_location() {
        let reporter = Reporter::new(source(), TemperatureScale::Celsius);
        let text = reporter.report(vec!["Garage", "Porch"], Utc::now()).unwrap();
        assert_eq!(
            text,
            "The Garage is currently 20.50°C, with high of 22.00°C and low of 18.25°C\n\
             The Porch is currently --, with high of -- and low of --\n"
        );
    }

    #[test]
    fn midnight_is_not_after_now() {
        let now = Local::now();
        let midnight = local_midnight(now);
        assert!(midnight <= now.with_timezone(&Utc));
        assert!(now.with_timezone(&Utc) - midnight <= chrono::Duration::hours(25));
    }
}
