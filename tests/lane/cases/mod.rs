mod commit;
mod execution;
