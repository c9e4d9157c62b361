use super::Simulation;
use super::policy::{PreferenceCenter, SingleStep, StaticSite};

type Factory = fn() -> Simulation;

static REGISTRY: &[(&str, Factory)] = &[
    ("simple_1", simple_1),
    ("click_to_unsub", click_to_unsub),
    ("enter_email", enter_email),
    ("bryant_park", bryant_park),
    ("goldbelly", goldbelly),
    ("honeywell", honeywell),
    ("peco", peco),
    ("fandango", fandango),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Fresh, unstarted simulation for `name`.
pub fn build(name: &str) -> Option<Simulation> {
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, factory)| factory())
}

fn simple_1() -> Simulation {
    Simulation::new("simple_1", StaticSite::new("simple_1.html"))
}

fn click_to_unsub() -> Simulation {
    Simulation::new("click_to_unsub", SingleStep::new("click_to_unsub.html"))
}

fn enter_email() -> Simulation {
    Simulation::new("enter_email", SingleStep::new("enter_email.html"))
}

fn bryant_park() -> Simulation {
    Simulation::new("bryant_park", SingleStep::new("bryant_park.html"))
}

fn goldbelly() -> Simulation {
    Simulation::new("goldbelly", PreferenceCenter::goldbelly())
}

fn honeywell() -> Simulation {
    Simulation::new("honeywell", PreferenceCenter::honeywell())
}

fn peco() -> Simulation {
    Simulation::new("peco", PreferenceCenter::peco())
}

fn fandango() -> Simulation {
    Simulation::new("fandango", PreferenceCenter::fandango())
}
