pub mod transfer_run;
