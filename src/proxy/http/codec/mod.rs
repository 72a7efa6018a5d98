mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::RequestHeaders;
pub(crate) use line::read_line_with_timeout;
pub(crate) use request::{Http1RequestHead, read_http1_request_head};
pub(crate) use response::{
    Http1ResponseHead, ResponseBodyPlan, determine_response_body_plan, encode_local_http1_head,
    read_final_response_head,
};
