use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::Result;
use crate::model::ChangeEvent;
use crate::mux::MuxServer;

/// Single-threaded consumer of the configuration store's change stream.
/// Each event maps onto idempotent mux CRUD calls; when an upsert touches
/// several fields they apply in a fixed precedence: listener membership,
/// cert, options, upstream binding, path, then middleware chain mutations.
/// A rejected event leaves the graph unchanged and is reported to the
/// supervisor; the mux keeps serving.
pub struct Configurator {
    mux: MuxServer,
}

impl Configurator {
    pub fn new(mux: MuxServer) -> Self {
        Self { mux }
    }

    pub async fn run(&self, mut events: mpsc::Receiver<ChangeEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.process_change(&event) {
                error!(error = %e, "change event rejected");
            }
        }
        debug!("change stream closed");
    }

    pub fn process_change(&self, event: &ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::HostAdded { host } => self.mux.upsert_host(host),
            ChangeEvent::HostDeleted { name } => self.mux.delete_host(name),
            ChangeEvent::HostCertUpdated { name, cert } => self.mux.update_host_cert(name, cert),
            ChangeEvent::HostListenerAdded { host, listener } => {
                self.mux.add_host_listener(host, listener)
            }
            ChangeEvent::HostListenerDeleted { host, listener_id } => {
                self.mux.delete_host_listener(host, listener_id)
            }
            ChangeEvent::LocationAdded { host, location } => {
                self.mux.upsert_location(host, location)
            }
            ChangeEvent::LocationDeleted { host, location_id } => {
                self.mux.delete_location(host, location_id)
            }
            ChangeEvent::LocationUpstreamUpdated { host, location } => {
                self.mux.update_location_upstream(host, location)
            }
            ChangeEvent::LocationPathUpdated { host, location } => {
                self.mux.update_location_path(host, location, &location.path)
            }
            ChangeEvent::LocationOptionsUpdated { host, location } => {
                self.mux.update_location_options(host, location)
            }
            ChangeEvent::LocationMiddlewareAdded {
                host,
                location,
                middleware,
            }
            | ChangeEvent::LocationMiddlewareUpdated {
                host,
                location,
                middleware,
            } => self.mux.upsert_location_middleware(host, location, middleware),
            ChangeEvent::LocationMiddlewareDeleted {
                host,
                location,
                middleware_type,
                middleware_id,
            } => self
                .mux
                .delete_location_middleware(host, location, middleware_type, middleware_id),
            ChangeEvent::UpstreamAdded { upstream } => self.mux.upsert_upstream(upstream),
            ChangeEvent::UpstreamDeleted { upstream_id } => self.mux.delete_upstream(upstream_id),
            ChangeEvent::EndpointAdded {
                upstream,
                endpoint,
                affected_locations,
            }
            | ChangeEvent::EndpointUpdated {
                upstream,
                endpoint,
                affected_locations,
            } => self.mux.upsert_endpoint(upstream, endpoint, affected_locations),
            ChangeEvent::EndpointDeleted {
                upstream,
                endpoint_id,
                affected_locations,
            } => self
                .mux
                .delete_endpoint(upstream, endpoint_id, affected_locations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Host, Location, Upstream};
    use crate::mux::MuxOptions;
    use crate::testutils::{make_location, make_rate_limit};

    fn setup() -> (Configurator, MuxServer) {
        let mux = MuxServer::new(MuxOptions::default());
        (Configurator::new(mux.clone()), mux)
    }

    fn endpoint_urls(mux: &MuxServer, host: &str, location: &str) -> Vec<String> {
        let mut urls: Vec<String> = mux
            .get_location(host, location)
            .unwrap()
            .endpoints()
            .iter()
            .map(|e| e.url().to_string())
            .collect();
        urls.sort();
        urls
    }

    fn fixture() -> (Location, Host) {
        make_location("localhost", "localhost:31000", "http://localhost:5000")
    }

    #[tokio::test]
    async fn add_delete_host() {
        let (conf, mux) = setup();
        let host = Host::new("localhost");

        conf.process_change(&ChangeEvent::HostAdded { host: host.clone() })
            .unwrap();
        assert!(mux.host_router("localhost").is_some());

        conf.process_change(&ChangeEvent::HostDeleted {
            name: "localhost".into(),
        })
        .unwrap();
        assert!(mux.host_router("localhost").is_none());
    }

    #[tokio::test]
    async fn add_delete_location() {
        let (conf, mux) = setup();
        let (mut location, host) = fixture();
        location.middlewares = vec![make_rate_limit("rl1", 100, "client.ip", 200, 10)];

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        let loc = mux.get_location("localhost", "loc1").unwrap();
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5000/"]
        );
        assert!(loc.middleware_chain().get("ratelimit.rl1").is_some());

        conf.process_change(&ChangeEvent::LocationDeleted {
            host: host.clone(),
            location_id: "loc1".into(),
        })
        .unwrap();
        assert!(mux.get_location("localhost", "loc1").is_none());
    }

    #[tokio::test]
    async fn add_location_twice_is_idempotent() {
        let (conf, mux) = setup();
        let (location, host) = fixture();

        for _ in 0..2 {
            conf.process_change(&ChangeEvent::LocationAdded {
                host: host.clone(),
                location: location.clone(),
            })
            .unwrap();
        }
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5000/"]
        );
    }

    #[tokio::test]
    async fn update_location_upstream() {
        let (conf, mux) = setup();
        let host = Host::new("localhost");
        let up1 = Upstream {
            id: "up1".into(),
            endpoints: vec![
                Endpoint::new("", "http://localhost:5000"),
                Endpoint::new("", "http://localhost:5001"),
            ],
        };
        let up2 = Upstream {
            id: "up2".into(),
            endpoints: vec![
                Endpoint::new("", "http://localhost:5001"),
                Endpoint::new("", "http://localhost:5002"),
            ],
        };
        let mut location = Location {
            hostname: "localhost".into(),
            id: "loc1".into(),
            path: "/home".into(),
            upstream: up1,
            middlewares: vec![],
            options: Default::default(),
        };

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5000/", "http://localhost:5001/"]
        );

        location.upstream = up2;
        conf.process_change(&ChangeEvent::LocationUpstreamUpdated {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5001/", "http://localhost:5002/"]
        );
    }

    #[tokio::test]
    async fn endpoint_crud_propagates_to_affected_locations() {
        let (conf, mux) = setup();
        let (location, host) = fixture();
        let mut upstream = location.upstream.clone();

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        let added = Endpoint::new("", "http://localhost:5008");
        upstream.endpoints.push(added.clone());
        conf.process_change(&ChangeEvent::EndpointAdded {
            upstream: upstream.clone(),
            endpoint: added.clone(),
            affected_locations: vec![location.clone()],
        })
        .unwrap();
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5000/", "http://localhost:5008/"]
        );

        conf.process_change(&ChangeEvent::EndpointDeleted {
            upstream: upstream.clone(),
            endpoint_id: added.key(),
            affected_locations: vec![location.clone()],
        })
        .unwrap();
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5000/"]
        );
    }

    #[tokio::test]
    async fn bad_endpoint_leaves_balancer_untouched() {
        let (conf, mux) = setup();
        let (location, host) = fixture();
        let upstream = location.upstream.clone();

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        let bad = Endpoint::new("", "http: local-host :500");
        let err = conf.process_change(&ChangeEvent::EndpointAdded {
            upstream,
            endpoint: bad,
            affected_locations: vec![location.clone()],
        });
        assert!(err.is_err());
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:5000/"]
        );
    }

    #[tokio::test]
    async fn endpoint_update_replaces_url() {
        let (conf, mux) = setup();
        let (location, host) = fixture();
        let upstream = location.upstream.clone();

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        let mut updated = upstream.endpoints[0].clone();
        updated.url = "http://localhost:7000".into();
        conf.process_change(&ChangeEvent::EndpointUpdated {
            upstream,
            endpoint: updated,
            affected_locations: vec![location.clone()],
        })
        .unwrap();
        assert_eq!(
            endpoint_urls(&mux, "localhost", "loc1"),
            vec!["http://localhost:7000/"]
        );
    }

    #[tokio::test]
    async fn add_remove_upstreams() {
        let (conf, _mux) = setup();
        let (location, _) = fixture();
        let upstream = location.upstream.clone();

        conf.process_change(&ChangeEvent::UpstreamAdded {
            upstream: upstream.clone(),
        })
        .unwrap();
        conf.process_change(&ChangeEvent::UpstreamDeleted {
            upstream_id: upstream.id,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn middleware_add_update_delete() {
        let (conf, mux) = setup();
        let (location, host) = fixture();

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        conf.process_change(&ChangeEvent::LocationMiddlewareAdded {
            host: host.clone(),
            location: location.clone(),
            middleware: make_rate_limit("r1", 10, "client.ip", 1, 1),
        })
        .unwrap();
        conf.process_change(&ChangeEvent::LocationMiddlewareAdded {
            host: host.clone(),
            location: location.clone(),
            middleware: make_rate_limit("r2", 10, "client.ip", 1, 1),
        })
        .unwrap();

        let loc = mux.get_location("localhost", "loc1").unwrap();
        assert!(loc.middleware_chain().get("ratelimit.r1").is_some());
        assert!(loc.middleware_chain().get("ratelimit.r2").is_some());

        // An update replaces the instance behind the same chain key.
        conf.process_change(&ChangeEvent::LocationMiddlewareUpdated {
            host: host.clone(),
            location: location.clone(),
            middleware: make_rate_limit("r1", 12, "client.ip", 20, 3),
        })
        .unwrap();
        assert_eq!(loc.middleware_chain().len(), 2);

        conf.process_change(&ChangeEvent::LocationMiddlewareDeleted {
            host: host.clone(),
            location: location.clone(),
            middleware_type: "ratelimit".into(),
            middleware_id: "r1".into(),
        })
        .unwrap();
        assert!(loc.middleware_chain().get("ratelimit.r1").is_none());
        assert!(loc.middleware_chain().get("ratelimit.r2").is_some());
    }

    #[tokio::test]
    async fn unknown_middleware_type_rejects_event() {
        let (conf, mux) = setup();
        let (mut location, host) = fixture();
        location.middlewares = vec![crate::model::MiddlewareInstance {
            kind: "teleporter".into(),
            id: "t1".into(),
            priority: 0,
            payload: serde_json::json!({}),
        }];

        let err = conf.process_change(&ChangeEvent::LocationAdded {
            host,
            location,
        });
        assert!(err.is_err());
        assert!(mux.get_location("localhost", "loc1").is_none());
    }

    #[tokio::test]
    async fn update_location_path_rebinds() {
        let (conf, mux) = setup();
        let (mut location, host) = fixture();

        conf.process_change(&ChangeEvent::LocationAdded {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        let router = mux.host_router("localhost").unwrap();
        assert!(router.route("/loc1").is_some());

        location.path = "/new/path".into();
        conf.process_change(&ChangeEvent::LocationPathUpdated {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        assert!(router.route("/loc1").is_none());
        assert!(router.route("/new/path").is_some());
    }

    #[tokio::test]
    async fn update_location_path_upserts_missing_location() {
        let (conf, mux) = setup();
        let (location, host) = fixture();

        conf.process_change(&ChangeEvent::LocationPathUpdated {
            host: host.clone(),
            location: location.clone(),
        })
        .unwrap();

        let router = mux.host_router("localhost").unwrap();
        assert!(router.route("/loc1").is_some());
        assert!(mux.get_location("localhost", "loc1").is_some());
    }
}
