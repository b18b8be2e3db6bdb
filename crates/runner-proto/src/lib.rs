pub mod runner {
    pub mod v1 {
        tonic::include_proto!("runner.v1");
    }
}
