// One integration binary; each module gets a fresh database via
// `helpers::spawn_app`. Requires running postgres and redis instances (see
// configuration.yaml).

mod allocation;
mod cancellation;
mod guests;
mod lifecycle;
mod outbox;
