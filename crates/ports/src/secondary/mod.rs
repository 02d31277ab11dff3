pub mod lb_table_port;
pub mod probe_port;
pub mod snat_rule_port;
