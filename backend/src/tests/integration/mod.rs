mod api;
mod lifecycle;
mod scenarios;
