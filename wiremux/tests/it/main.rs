mod cancel;
mod handshake;
mod helper;
mod hub;
mod service;
