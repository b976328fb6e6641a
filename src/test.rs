mod mock;
mod util;

pub(crate) use self::{
    mock::{MockDeployment, MockFailure, MockRole},
    util::{init_tracing, wait_until, EventBuffer},
};
