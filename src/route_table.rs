//! In-memory route table: route id → sink.
//!
//! Written only by the control-plane FSM apply path, read by every publisher
//! worker and REST handler. Snapshot/load exist for FSM snapshotting.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::route::Route;

pub struct RouteTable {
    routes: RwLock<HashMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable {
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, route: Route) {
        self.routes.write().unwrap().insert(route.id.clone(), route);
    }

    pub fn remove(&self, id: &str) {
        self.routes.write().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Route> {
        self.routes.read().unwrap().get(id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Route> {
        self.routes.read().unwrap().clone()
    }

    pub fn load(&self, routes: HashMap<String, Route>) {
        *self.routes.write().unwrap() = routes;
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
