pub(crate) mod launch;
