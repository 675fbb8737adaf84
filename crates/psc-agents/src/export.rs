//! Writing the experiment's findings.
//!
//! The properties file is XML with one `<property>` element per retained
//! finding. Hot-region bookkeeping properties are never written.

use std::path::{Path, PathBuf};

use chrono::Local;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use uuid::Uuid;

use psc_core::Property;

use crate::error::AgentError;

const NAMESPACE: &str = "http://www.lrr.in.tum.de/Periscope";
const SCHEMA_INSTANCE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str = "http://www.lrr.in.tum.de/Periscope psc_properties.xsd";

/// Header data of an exported experiment.
#[derive(Debug, Clone)]
pub struct ExperimentInfo {
    pub run_id: Uuid,
    pub app_name: String,
    pub processes: u32,
    pub threads: u32,
    /// Working directory the run was started from.
    pub directory: String,
}

fn xml_err<E: std::fmt::Display>(err: E) -> AgentError {
    AgentError::Export {
        path: PathBuf::new(),
        reason: err.to_string(),
    }
}

fn text<W: std::io::Write>(writer: &mut Writer<W>, name: &str, value: &str) -> Result<(), AgentError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

fn write_property<W: std::io::Write>(
    writer: &mut Writer<W>,
    property: &Property,
) -> Result<(), AgentError> {
    let cluster = property.cluster.to_string();
    let start = BytesStart::new("property")
        .with_attributes([("cluster", cluster.as_str()), ("ID", property.id.as_str())]);
    writer.write_event(Event::Start(start)).map_err(xml_err)?;

    text(writer, "name", &property.name)?;

    let file_id = property.file_id.to_string();
    let line = property.start_line.to_string();
    let context = BytesStart::new("context").with_attributes([
        ("FileID", file_id.as_str()),
        ("FileName", property.file_name.as_str()),
        ("StartLine", line.as_str()),
        ("Config", property.configuration.as_str()),
        ("Region", property.region_type.as_str()),
        ("RegionId", property.region_id.as_str()),
    ]);
    writer.write_event(Event::Empty(context)).map_err(xml_err)?;

    for exec in property.instances() {
        let process = exec.process.to_string();
        let thread = exec.thread.to_string();
        let obj = BytesStart::new("execObj")
            .with_attributes([("process", process.as_str()), ("thread", thread.as_str())]);
        writer.write_event(Event::Empty(obj)).map_err(xml_err)?;
    }

    text(writer, "severity", &property.severity.to_string())?;
    text(writer, "confidence", &property.confidence.to_string())?;

    if !property.extra_info.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("addInfo")))
            .map_err(xml_err)?;
        for (key, value) in &property.extra_info {
            let info = BytesStart::new("info").with_attributes([("key", key.as_str())]);
            writer.write_event(Event::Start(info)).map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("info")))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("addInfo")))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("property")))
        .map_err(xml_err)?;
    Ok(())
}

/// Renders the experiment document. Returns the XML and the number of
/// `<property>` elements in it.
pub fn properties_xml(info: &ExperimentInfo, props: &[Property]) -> Result<(String, usize), AgentError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let run_id = info.run_id.to_string();
    let root = BytesStart::new("Experiment").with_attributes([
        ("xmlns", NAMESPACE),
        ("xmlns:xsi", SCHEMA_INSTANCE),
        ("xsi:schemaLocation", SCHEMA_LOCATION),
        ("runId", run_id.as_str()),
    ]);
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    let now = Local::now();
    text(&mut writer, "application", &info.app_name)?;
    text(&mut writer, "date", &now.format("%Y-%m-%d").to_string())?;
    text(&mut writer, "time", &now.format("%H:%M:%S").to_string())?;
    text(&mut writer, "numProcs", &info.processes.to_string())?;
    text(&mut writer, "numThreads", &info.threads.to_string())?;
    text(&mut writer, "dir", &info.directory)?;

    let mut written = 0;
    for property in props.iter().filter(|p| !p.is_hot_region()) {
        write_property(&mut writer, property)?;
        written += 1;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Experiment")))
        .map_err(xml_err)?;
    let xml = String::from_utf8(writer.into_inner()).map_err(xml_err)?;
    Ok((xml, written))
}

/// Writes the properties file; returns how many properties went in.
pub fn write_properties(
    path: &Path,
    info: &ExperimentInfo,
    props: &[Property],
) -> Result<usize, AgentError> {
    let export_err = |reason: String| AgentError::Export {
        path: path.to_path_buf(),
        reason,
    };
    let (xml, written) = properties_xml(info, props).map_err(|err| match err {
        AgentError::Export { reason, .. } => export_err(reason),
        other => other,
    })?;
    std::fs::write(path, xml).map_err(|e| export_err(e.to_string()))?;
    tracing::info!(path = %path.display(), properties = written, "properties exported");
    Ok(written)
}

/// Top `limit` properties by severity as a plain-text table.
pub fn summary_table(props: &[Property], limit: usize) -> String {
    let mut ranked: Vec<&Property> = props.iter().filter(|p| !p.is_hot_region()).collect();
    ranked.sort_by(|a, b| b.severity.total_cmp(&a.severity));

    let mut out = format!(
        "{:>4}  {:>9}  {:>5}  {:<30}  {}\n",
        "#", "severity", "procs", "region", "property"
    );
    for (rank, p) in ranked.iter().take(limit).enumerate() {
        out.push_str(&format!(
            "{:>4}  {:>9.2}  {:>5}  {:<30}  {}\n",
            rank + 1,
            p.severity,
            p.process_count(),
            p.region_key(),
            p.name
        ));
    }
    if ranked.len() > limit {
        out.push_str(&format!("({} more not shown)\n", ranked.len() - limit));
    }
    out
}
