pub mod aws_event_stream;
