fn main() {
    shelf_sync::run()
}
