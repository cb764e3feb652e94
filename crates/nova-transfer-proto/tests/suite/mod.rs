mod framing;
mod messages;
