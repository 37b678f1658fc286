fn main() {
    authenticator_sync::run()
}
