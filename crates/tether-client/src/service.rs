// Micro-service endpoint registry with ping/info/stats discovery
// subjects.
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tether_wire::{Message, Payload};
use tracing::error;
use uuid::Uuid;

use crate::client::{Client, Reply};
use crate::{Error, Result};

const PING_RESPONSE_TYPE: &str = "io.nats.micro.v1.ping_response";
const INFO_RESPONSE_TYPE: &str = "io.nats.micro.v1.info_response";
const STATS_RESPONSE_TYPE: &str = "io.nats.micro.v1.stats_response";

/// Endpoint handlers answer with a payload or a textual error that is
/// recorded in the endpoint's stats.
pub type EndpointHandler = Rc<dyn Fn(&Message) -> std::result::Result<Payload, String>>;

struct EndpointDef {
    name: String,
    subject: String,
    handler: EndpointHandler,
}

/// Per-endpoint counters reported on `$SRV.STATS`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub subject: String,
    pub num_requests: u64,
    pub num_errors: u64,
    pub processing_time_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Serialize)]
struct PingResponse<'s> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'s str,
    id: &'s str,
    version: &'s str,
}

#[derive(Serialize)]
struct EndpointInfo<'s> {
    name: &'s str,
    subject: &'s str,
}

#[derive(Serialize)]
struct InfoResponse<'s> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'s str,
    id: &'s str,
    version: &'s str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'s str>,
    endpoints: Vec<EndpointInfo<'s>>,
}

#[derive(Serialize)]
struct StatsResponse<'s> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'s str,
    id: &'s str,
    version: &'s str,
    endpoints: Vec<EndpointStats>,
}

/// A named service instance: application endpoints plus the three
/// discovery subjects. All dispatch runs inside the owning client's
/// process loop.
pub struct Service {
    name: String,
    id: String,
    version: String,
    description: Option<String>,
    endpoints: Vec<EndpointDef>,
    stats: Rc<RefCell<Vec<EndpointStats>>>,
    sids: Vec<u64>,
    started: bool,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4().simple().to_string(),
            version: version.into(),
            description: None,
            endpoints: Vec::new(),
            stats: Rc::new(RefCell::new(Vec::new())),
            sids: Vec::new(),
            started: false,
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register an endpoint. Takes effect on `start`.
    pub fn add_endpoint<F>(&mut self, name: impl Into<String>, subject: impl Into<String>, handler: F)
    where
        F: Fn(&Message) -> std::result::Result<Payload, String> + 'static,
    {
        self.endpoints.push(EndpointDef {
            name: name.into(),
            subject: subject.into(),
            handler: Rc::new(handler),
        });
    }

    /// Snapshot of the per-endpoint counters.
    pub fn stats(&self) -> Vec<EndpointStats> {
        self.stats.borrow().clone()
    }

    /// Subscribe every endpoint and the discovery subjects.
    pub fn start(&mut self, client: &mut Client) -> Result<()> {
        if self.started {
            return Err(Error::Config(format!(
                "service {} already started",
                self.name
            )));
        }
        *self.stats.borrow_mut() = self
            .endpoints
            .iter()
            .map(|endpoint| EndpointStats {
                name: endpoint.name.clone(),
                subject: endpoint.subject.clone(),
                ..EndpointStats::default()
            })
            .collect();

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let stats = Rc::clone(&self.stats);
            let handler = Rc::clone(&endpoint.handler);
            let sid = client.subscribe(&endpoint.subject, move |msg| {
                let started = Instant::now();
                let outcome = handler(msg);
                let elapsed = started.elapsed().as_nanos() as u64;
                let mut stats = stats.borrow_mut();
                let slot = &mut stats[index];
                slot.num_requests += 1;
                slot.processing_time_ns += elapsed;
                match outcome {
                    Ok(payload) if msg.reply.is_some() => Ok(Some(Reply::Payload(payload))),
                    Ok(_) => Ok(None),
                    Err(message) => {
                        slot.num_errors += 1;
                        error!(subject = %msg.subject, error = %message, "endpoint failed");
                        slot.last_error = Some(message);
                        Ok(None)
                    }
                }
            })?;
            self.sids.push(sid);
        }

        self.subscribe_discovery(client, "PING")?;
        self.subscribe_discovery(client, "INFO")?;
        self.subscribe_discovery(client, "STATS")?;
        self.started = true;
        Ok(())
    }

    /// Unsubscribe everything registered by `start`.
    pub fn stop(&mut self, client: &mut Client) -> Result<()> {
        for sid in self.sids.drain(..) {
            client.unsubscribe(sid)?;
        }
        self.started = false;
        Ok(())
    }

    fn subscribe_discovery(&mut self, client: &mut Client, verb: &str) -> Result<()> {
        let subjects = [
            format!("$SRV.{verb}"),
            format!("$SRV.{verb}.{}", self.name),
            format!("$SRV.{verb}.{}.{}", self.name, self.id),
        ];
        for subject_name in subjects {
            let responder = self.discovery_responder(verb)?;
            let sid = client.subscribe(&subject_name, move |msg| {
                if msg.reply.is_none() {
                    return Ok(None);
                }
                Ok(Some(Reply::Payload(responder()?)))
            })?;
            self.sids.push(sid);
        }
        Ok(())
    }

    // A closure producing the discovery response body for one verb.
    fn discovery_responder(&self, verb: &str) -> Result<Rc<dyn Fn() -> Result<Payload>>> {
        let name = self.name.clone();
        let id = self.id.clone();
        let version = self.version.clone();
        match verb {
            "PING" => Ok(Rc::new(move || {
                Ok(Payload::from(serde_json::to_vec(&PingResponse {
                    kind: PING_RESPONSE_TYPE,
                    name: &name,
                    id: &id,
                    version: &version,
                })?))
            })),
            "INFO" => {
                let description = self.description.clone();
                let endpoints: Vec<(String, String)> = self
                    .endpoints
                    .iter()
                    .map(|endpoint| (endpoint.name.clone(), endpoint.subject.clone()))
                    .collect();
                Ok(Rc::new(move || {
                    Ok(Payload::from(serde_json::to_vec(&InfoResponse {
                        kind: INFO_RESPONSE_TYPE,
                        name: &name,
                        id: &id,
                        version: &version,
                        description: description.as_deref(),
                        endpoints: endpoints
                            .iter()
                            .map(|(name, subject)| EndpointInfo { name, subject })
                            .collect(),
                    })?))
                }))
            }
            "STATS" => {
                let stats = Rc::clone(&self.stats);
                Ok(Rc::new(move || {
                    Ok(Payload::from(serde_json::to_vec(&StatsResponse {
                        kind: STATS_RESPONSE_TYPE,
                        name: &name,
                        id: &id,
                        version: &version,
                        endpoints: stats.borrow().clone(),
                    })?))
                }))
            }
            other => Err(Error::Config(format!("unknown discovery verb: {other}"))),
        }
    }
}
