mod helpers;

mod failover;
mod membership;
mod rebalance;
mod regions;
mod replication;
