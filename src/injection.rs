//! Enumerates mutated variants of a captured request for SQL-injection
//! fuzzing, in the fixed order spec §4.3 requires.

use crate::message::{self, ParamValue};
use crate::request::Request;

/// Where a mutated value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Query,
    Form,
    Header,
    Cookie,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Query => "query",
            Location::Form => "form",
            Location::Header => "header",
            Location::Cookie => "cookie",
        }
    }
}

/// One `(location, name, payload)` mutation point, paired with the request
/// it produces. Transient: built on demand, never persisted.
#[derive(Debug, Clone)]
pub struct InjectionPoint {
    pub location: Location,
    pub name: String,
    pub payload: &'static str,
}

const PAYLOADS: [&str; 2] = ["'", "\""];

/// Lazily enumerates every injection variant of a source request. Restartable:
/// `InjectionIterator::new` always rebuilds the same plan from the source
/// request, and `Clone` duplicates the already-computed plan plus index.
#[derive(Clone)]
pub struct InjectionIterator {
    source: Request,
    plan: Vec<InjectionPoint>,
    index: usize,
}

impl InjectionIterator {
    pub fn new(source: Request) -> Self {
        let plan = build_plan(&source);
        Self { source, plan, index: 0 }
    }

    /// The injection point the most recently yielded item corresponds to,
    /// i.e. `plan[index - 1]`. Used by the scanner to label findings.
    pub fn current_point(&self) -> Option<&InjectionPoint> {
        self.index.checked_sub(1).and_then(|i| self.plan.get(i))
    }

    pub fn len(&self) -> usize {
        self.plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }
}

impl Iterator for InjectionIterator {
    type Item = Request;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.plan.get(self.index)?;
        self.index += 1;
        Some(apply_mutation(&self.source, point))
    }
}

/// Build the fixed enumeration order: query params, form params, headers
/// (excluding `Cookie`), then cookies — each yielded with both payloads.
fn build_plan(request: &Request) -> Vec<InjectionPoint> {
    let mut plan = Vec::new();

    for (name, _) in request.get_params.iter() {
        for payload in PAYLOADS {
            plan.push(InjectionPoint { location: Location::Query, name: name.clone(), payload });
        }
    }

    for (name, _) in request.post_params.iter() {
        for payload in PAYLOADS {
            plan.push(InjectionPoint { location: Location::Form, name: name.clone(), payload });
        }
    }

    for (name, _) in request.headers.iter() {
        if name.eq_ignore_ascii_case("Cookie") {
            continue;
        }
        for payload in PAYLOADS {
            plan.push(InjectionPoint { location: Location::Header, name: name.clone(), payload });
        }
    }

    for (name, _) in request.cookies.iter() {
        for payload in PAYLOADS {
            plan.push(InjectionPoint { location: Location::Cookie, name: name.clone(), payload });
        }
    }

    plan
}

/// Apply exactly one mutation (the point's own payload) to a deep clone of
/// `source`, leaving every other field untouched.
fn apply_mutation(source: &Request, point: &InjectionPoint) -> Request {
    let mut mutated = source.clone();
    mutated.id = None;

    let payload = point.payload;

    match point.location {
        Location::Query => {
            mutate_param(&mut mutated.get_params, &point.name, payload);
        }
        Location::Form => {
            mutate_param(&mut mutated.post_params, &point.name, payload);
        }
        Location::Header => {
            if let Some(current) = mutated.headers.get(&point.name).cloned() {
                mutated.headers.insert(point.name.clone(), format!("{current}{payload}"));
            }
        }
        Location::Cookie => {
            if let Some(current) = mutated.cookies.get(&point.name).cloned() {
                mutated.cookies.insert(point.name.clone(), format!("{current}{payload}"));
            }
            // Keep the `Cookie` header consistent with the mutated jar on
            // emit, per spec §9 observed-bug note (d).
            mutated
                .headers
                .insert_ci("Cookie", message::emit_cookie_header(&mutated.cookies));
        }
    }

    mutated
}

fn mutate_param(map: &mut message::OrderedMap<ParamValue>, name: &str, payload: &str) {
    if let Some(existing) = map.get(name).cloned() {
        let mutated = match existing {
            ParamValue::Single(v) => ParamValue::Single(format!("{v}{payload}")),
            ParamValue::Multi(mut values) => {
                if let Some(last) = values.last_mut() {
                    last.push_str(payload);
                }
                ParamValue::Multi(values)
            }
        };
        map.insert(name.to_string(), mutated);
    }
}
