use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub struct ResultVec: IntCounter {
        "result" => {
            accept,
            reject,
        }
    }
}

lazy_static! {
    pub static ref AUTH_ATTEMPTS: IntCounter = register_int_counter!(
        "ssh_auth_attempts_total",
        "Number of agent authentication attempts"
    )
    .unwrap();
    static ref AUTH_RESULTS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!(
            "ssh_auth_results_total",
            "Agent authentication results by outcome"
        ),
        &["result"],
    )
    .unwrap();
    pub static ref AUTH_RESULTS: ResultVec = ResultVec::from(&AUTH_RESULTS_VEC);
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "ssh_active_sessions",
        "Number of live agent control connections"
    )
    .unwrap();
    pub static ref TOTAL_SESSIONS: IntCounter = register_int_counter!(
        "ssh_sessions_total",
        "Total agent control connections accepted"
    )
    .unwrap();
    pub static ref REGISTRATIONS: IntCounter = register_int_counter!(
        "ssh_registrations_total",
        "Registrations forwarded to the registry"
    )
    .unwrap();
    pub static ref TUNNEL_CONNECTIONS: IntCounter = register_int_counter!(
        "tunnel_connections_total",
        "Operator connections forwarded through reverse tunnels"
    )
    .unwrap();
}
